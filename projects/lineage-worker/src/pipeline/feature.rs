use crate::error::PipelineError;
use crate::pipeline::types::{FeatureKind, ObjectFeatureSet, RegionProps};
use anyhow::Result;
use ndarray::{s, Array2, Array3, Axis};
use std::collections::BTreeMap;

/// Reads one timepoint column out of the padded region property arrays.
///
/// The result keeps the row order and axis layout of the input; it is not
/// aligned yet.
pub struct PerTimepointFeatureExtractor;

impl PerTimepointFeatureExtractor {
    pub fn extract(&self, props: &RegionProps, t: usize) -> Result<ObjectFeatureSet> {
        if t >= props.num_timepoints() {
            return Err(PipelineError::ShapeMismatch {
                what: format!("timepoint {}", t),
                expected: vec![props.num_timepoints()],
                actual: vec![t + 1],
            }
            .into());
        }

        // Padding slots carry label 0 and may appear anywhere in the column
        let rows: Vec<usize> = props
            .label_column(t)
            .iter()
            .enumerate()
            .filter(|(_, &label)| label != 0)
            .map(|(row, _)| row)
            .collect();

        let column = |a: &Array2<f32>| -> Array2<f32> {
            a.slice(s![.., t])
                .select(Axis(0), &rows)
                .insert_axis(Axis(1))
        };
        let columns = |a: &Array3<f32>| -> Array2<f32> {
            a.slice(s![.., .., t]).select(Axis(1), &rows).reversed_axes()
        };

        let mut features = BTreeMap::new();
        features.insert(FeatureKind::EquivalentDiameter, column(&props.diameters));
        features.insert(FeatureKind::IntensityMean, column(&props.intensities));
        features.insert(FeatureKind::InertiaTensor, columns(&props.inertia_tensors));
        features.insert(FeatureKind::BorderDist, column(&props.border_dists));

        Ok(ObjectFeatureSet {
            timepoint: t,
            labels: props.labels.slice(s![.., t]).select(Axis(0), &rows),
            coords: columns(&props.coords),
            timepoints: props.timepoints.slice(s![.., t]).select(Axis(0), &rows),
            features,
        })
    }
}

/// Brings every array of a feature set into one canonical object order and
/// axis layout.
pub struct FeatureAligner;

impl FeatureAligner {
    /// Flip stored (last-axis-first) vector columns to array axis order.
    pub fn canonicalize_axes(&self, mut set: ObjectFeatureSet) -> ObjectFeatureSet {
        set.coords.invert_axis(Axis(1));
        for (kind, values) in set.features.iter_mut() {
            if kind.is_axis_reversed() {
                values.invert_axis(Axis(1));
            }
        }
        set
    }

    /// Reorder rows by ascending label, applying the same permutation to
    /// every array. Equal labels keep their relative order.
    pub fn sort_by_label(&self, set: ObjectFeatureSet) -> ObjectFeatureSet {
        let mut order: Vec<usize> = (0..set.labels.len()).collect();
        order.sort_by_key(|&i| set.labels[i]);

        let rows = |a: &Array2<f32>| a.select(Axis(0), &order);
        ObjectFeatureSet {
            timepoint: set.timepoint,
            labels: set.labels.select(Axis(0), &order),
            coords: rows(&set.coords),
            timepoints: set.timepoints.select(Axis(0), &order),
            features: set
                .features
                .iter()
                .map(|(kind, values)| (*kind, rows(values)))
                .collect(),
        }
    }

    pub fn align(&self, set: ObjectFeatureSet) -> ObjectFeatureSet {
        self.sort_by_label(self.canonicalize_axes(set))
    }
}

/// Extract and align every timepoint.
pub fn extract_feature_sets(props: &RegionProps) -> Result<Vec<ObjectFeatureSet>> {
    let extractor = PerTimepointFeatureExtractor;
    let aligner = FeatureAligner;
    (0..props.num_timepoints())
        .map(|t| Ok(aligner.align(extractor.extract(props, t)?)))
        .collect()
}

/// Total number of objects across feature sets.
pub fn count_objects(sets: &[ObjectFeatureSet]) -> usize {
    sets.iter().map(|s| s.len()).sum()
}
