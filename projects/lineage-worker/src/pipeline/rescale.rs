use crate::error::PipelineError;
use crate::pipeline::types::{LabelImage, Volume};
use anyhow::Result;
use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};

/// Object diameters in pixels. Negative values mean "unset".
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct DiameterSettings {
    #[serde(rename = "estimated_diameter_xy")]
    pub estimated_xy: f64,
    #[serde(rename = "estimated_diameter_z")]
    pub estimated_z: f64,
    #[serde(rename = "expected_diameter_xy")]
    pub expected_xy: f64,
    #[serde(rename = "expected_diameter_z")]
    pub expected_z: f64,
}

impl Default for DiameterSettings {
    fn default() -> Self {
        Self {
            estimated_xy: 30.0,
            estimated_z: 10.0,
            expected_xy: 30.0,
            expected_z: 10.0,
        }
    }
}

/// Ratio of estimated to expected diameter, or 1.0 when either is unset.
pub fn scale_for(expected: f64, estimated: f64) -> f64 {
    if expected >= 0.0 && estimated >= 0.0 {
        if expected == 0.0 {
            // Nothing to compare against
            return 1.0;
        }
        estimated / expected
    } else {
        1.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleFactors {
    pub xy: f64,
    pub z: f64,
}

impl ScaleFactors {
    pub fn from_diameters(settings: &DiameterSettings) -> Self {
        Self {
            xy: scale_for(settings.expected_xy, settings.estimated_xy),
            z: scale_for(settings.expected_z, settings.estimated_z),
        }
    }

    /// Per-axis zoom in array order: (z, y, x) for volumes, (y, x) for planes.
    pub fn zoom_vector(&self, spatial_rank: usize) -> Result<Vec<f64>> {
        match spatial_rank {
            3 => Ok(vec![self.z, self.xy, self.xy]),
            2 => Ok(vec![self.xy, self.xy]),
            other => Err(PipelineError::UnsupportedRank(other).into()),
        }
    }
}

/// Output shape of a zoom, rounding half to even and never collapsing an axis.
pub fn zoomed_shape(shape: &[usize], zoom: &[f64]) -> Vec<usize> {
    shape
        .iter()
        .zip(zoom)
        .map(|(&n, &z)| ((n as f64 * z).round_ties_even().max(1.0)) as usize)
        .collect()
}

/// Source coordinate of every output sample along one axis.
///
/// End points are aligned, so the first and last samples of input and
/// output coincide.
pub fn source_coordinates(n_in: usize, n_out: usize) -> Vec<f64> {
    if n_out <= 1 {
        return vec![0.0; n_out];
    }
    let step = (n_in as f64 - 1.0) / (n_out as f64 - 1.0);
    (0..n_out).map(|o| o as f64 * step).collect()
}

fn resample_axis_linear(data: &ArrayD<f32>, axis: usize, n_out: usize) -> ArrayD<f32> {
    let n_in = data.shape()[axis];
    let mut shape = data.shape().to_vec();
    shape[axis] = n_out;
    let mut out = ArrayD::<f32>::zeros(shape);

    for (o, c) in source_coordinates(n_in, n_out).into_iter().enumerate() {
        let i0 = (c.floor() as usize).min(n_in - 1);
        let i1 = (i0 + 1).min(n_in - 1);
        let frac = (c - i0 as f64) as f32;
        let lo = data.index_axis(Axis(axis), i0);
        let mut lane = out.index_axis_mut(Axis(axis), o);
        if frac <= f32::EPSILON || i0 == i1 {
            lane.assign(&lo);
        } else {
            let hi = data.index_axis(Axis(axis), i1);
            lane.assign(&(&lo * (1.0 - frac) + &hi * frac));
        }
    }
    out
}

fn resample_axis_nearest<T: Clone + Default>(data: &ArrayD<T>, axis: usize, n_out: usize) -> ArrayD<T> {
    let n_in = data.shape()[axis];
    let mut shape = data.shape().to_vec();
    shape[axis] = n_out;
    let mut out = ArrayD::<T>::default(shape);

    for (o, c) in source_coordinates(n_in, n_out).into_iter().enumerate() {
        let src = ((c + 0.5).floor() as usize).min(n_in - 1);
        out.index_axis_mut(Axis(axis), o)
            .assign(&data.index_axis(Axis(axis), src));
    }
    out
}

/// Linear (order 1) zoom to an explicit output shape.
pub fn zoom_linear(data: &ArrayD<f32>, out_shape: &[usize]) -> ArrayD<f32> {
    let mut current = data.clone();
    for (axis, &n_out) in out_shape.iter().enumerate() {
        if current.shape()[axis] != n_out {
            current = resample_axis_linear(&current, axis, n_out);
        }
    }
    current
}

/// Nearest-neighbour (order 0) zoom to an explicit output shape.
///
/// Every output value is copied from the input, so categorical data such as
/// label identifiers stay intact.
pub fn zoom_nearest<T: Clone + Default>(data: &ArrayD<T>, out_shape: &[usize]) -> ArrayD<T> {
    let mut current = data.clone();
    for (axis, &n_out) in out_shape.iter().enumerate() {
        if current.shape()[axis] != n_out {
            current = resample_axis_nearest(&current, axis, n_out);
        }
    }
    current
}

// Resampling needs at least one source sample per axis
fn ensure_non_empty(what: &str, shape: &[usize]) -> Result<()> {
    if shape.contains(&0) {
        return Err(PipelineError::ShapeMismatch {
            what: format!("empty axis in {}", what),
            expected: shape.iter().map(|&n| n.max(1)).collect(),
            actual: shape.to_vec(),
        }
        .into());
    }
    Ok(())
}

/// Result of bringing a volume to the scale a model expects.
#[derive(Debug, Clone)]
pub struct Rescaled {
    pub volume: Volume,
    pub zoom: Vec<f64>,
    pub original_shape: Vec<usize>,
    /// `original / rescaled` per spatial axis, from realized shapes
    pub inverse_factors: Vec<f64>,
}

impl Rescaled {
    pub fn rescaled_shape(&self) -> &[usize] {
        self.volume.spatial_shape()
    }
}

pub struct AnisotropicRescaler {
    factors: ScaleFactors,
}

impl AnisotropicRescaler {
    pub fn new(settings: &DiameterSettings) -> Self {
        Self {
            factors: ScaleFactors::from_diameters(settings),
        }
    }

    pub fn factors(&self) -> ScaleFactors {
        self.factors
    }

    pub fn rescale(&self, volume: &Volume) -> Result<Rescaled> {
        let spatial_rank = volume.spatial_rank();
        let zoom = self.factors.zoom_vector(spatial_rank)?;
        let original_shape = volume.spatial_shape().to_vec();
        ensure_non_empty("volume", &original_shape)?;

        let mut out_shape = zoomed_shape(&original_shape, &zoom);
        if volume.has_channel {
            out_shape.push(volume.data.shape()[spatial_rank]);
        }
        let data = zoom_linear(&volume.data, &out_shape);

        let inverse_factors = original_shape
            .iter()
            .zip(&out_shape)
            .map(|(&orig, &scaled)| orig as f64 / scaled as f64)
            .collect();

        tracing::debug!(
            "Rescaled {:?} -> {:?} with zoom {:?}",
            volume.data.shape(),
            data.shape(),
            zoom
        );

        Ok(Rescaled {
            volume: Volume::new(data, volume.dtype, volume.has_channel),
            zoom,
            original_shape,
            inverse_factors,
        })
    }
}

/// Brings a label image back to the resolution of the original volume.
pub struct LabelUnscaler;

impl LabelUnscaler {
    pub fn unscale(
        &self,
        labels: &LabelImage,
        inverse_factors: &[f64],
        original_shape: &[usize],
    ) -> Result<LabelImage> {
        if labels.ndim() != inverse_factors.len() {
            return Err(PipelineError::ShapeMismatch {
                what: "label image rank".to_string(),
                expected: vec![inverse_factors.len()],
                actual: vec![labels.ndim()],
            }
            .into());
        }
        ensure_non_empty("label image", labels.shape())?;
        let target = zoomed_shape(labels.shape(), inverse_factors);
        if target != original_shape {
            return Err(PipelineError::ShapeMismatch {
                what: "unscaled label image".to_string(),
                expected: original_shape.to_vec(),
                actual: target,
            }
            .into());
        }
        Ok(zoom_nearest(labels, &target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::ElementType;
    use approx::assert_relative_eq;
    use ndarray::{array, Array3};
    use std::collections::BTreeSet;

    #[test]
    fn test_scale_for_non_negative_pairs() {
        for (expected, estimated) in [(10.0, 5.0), (30.0, 30.0), (7.0, 0.0), (1.0, 123.5)] {
            assert_relative_eq!(scale_for(expected, estimated), estimated / expected);
        }
        for (expected, estimated) in [(-1.0, 10.0), (10.0, -1.0), (-3.0, -3.0)] {
            assert_eq!(scale_for(expected, estimated), 1.0);
        }
        assert_eq!(scale_for(0.0, 10.0), 1.0);
        assert_eq!(scale_for(f64::NAN, 10.0), 1.0);
    }

    #[test]
    fn test_unset_depth_keeps_unit_scale() {
        let settings = DiameterSettings {
            expected_xy: 20.0,
            estimated_xy: 40.0,
            expected_z: -1.0,
            estimated_z: 10.0,
        };
        let factors = ScaleFactors::from_diameters(&settings);
        assert_eq!(factors.xy, 2.0);
        assert_eq!(factors.z, 1.0);
        assert_eq!(factors.zoom_vector(3).unwrap(), vec![1.0, 2.0, 2.0]);
        assert_eq!(factors.zoom_vector(2).unwrap(), vec![2.0, 2.0]);
        assert!(factors.zoom_vector(4).is_err());
    }

    #[test]
    fn test_linear_zoom_interpolates_between_samples() {
        let data = array![0.0f32, 10.0].into_dyn();
        let out = zoom_linear(&data, &[3]);
        assert_eq!(out.shape(), &[3]);
        assert_relative_eq!(out[[1]], 5.0);
        assert_relative_eq!(out[[2]], 10.0);
    }

    #[test]
    fn test_zoomed_shape_rounds_half_to_even() {
        assert_eq!(zoomed_shape(&[5, 3], &[0.5, 0.5]), vec![2, 2]);
        assert_eq!(zoomed_shape(&[7], &[0.5]), vec![4]);
        assert_eq!(zoomed_shape(&[4], &[0.0]), vec![1]);
    }

    #[test]
    fn test_round_trip_restores_exact_shape() {
        let cases: [(&[usize], DiameterSettings); 3] = [
            (
                &[7, 33, 41],
                DiameterSettings {
                    expected_xy: 27.0,
                    estimated_xy: 10.0,
                    expected_z: 3.0,
                    estimated_z: 5.1,
                },
            ),
            (
                &[64, 17],
                DiameterSettings {
                    expected_xy: 30.0,
                    estimated_xy: 47.0,
                    ..Default::default()
                },
            ),
            (&[5, 9, 11], DiameterSettings::default()),
        ];

        for (shape, settings) in cases {
            let volume = Volume::new(ArrayD::zeros(shape.to_vec()), ElementType::Uint16, false);
            let rescaled = AnisotropicRescaler::new(&settings).rescale(&volume).unwrap();

            let labels = LabelImage::zeros(rescaled.rescaled_shape().to_vec());
            let restored = LabelUnscaler
                .unscale(&labels, &rescaled.inverse_factors, &rescaled.original_shape)
                .unwrap();
            assert_eq!(restored.shape(), shape);
        }
    }

    #[test]
    fn test_unscaling_never_invents_labels() {
        let labels = Array3::from_shape_fn((4, 9, 13), |(z, y, x)| {
            if x < 3 {
                0
            } else {
                ((z * 31 + y * 7 + x) % 5) as i32 + 1
            }
        })
        .into_dyn();
        let before: BTreeSet<i32> = labels.iter().copied().collect();

        let restored = LabelUnscaler
            .unscale(&labels, &[10.0 / 4.0, 20.0 / 9.0, 25.0 / 13.0], &[10, 20, 25])
            .unwrap();
        assert_eq!(restored.shape(), &[10, 20, 25]);
        let after: BTreeSet<i32> = restored.iter().copied().collect();
        assert!(after.is_subset(&before));
    }

    #[test]
    fn test_unscale_rejects_inconsistent_factors() {
        let labels = LabelImage::zeros(vec![4, 4]);
        assert!(LabelUnscaler.unscale(&labels, &[2.0, 2.0], &[8, 9]).is_err());
        assert!(LabelUnscaler.unscale(&labels, &[2.0], &[8]).is_err());
    }

    #[test]
    fn test_channel_axis_is_not_zoomed() {
        let volume = Volume::new(ArrayD::zeros(vec![10, 12, 3]), ElementType::Float32, true);
        let settings = DiameterSettings {
            expected_xy: 10.0,
            estimated_xy: 5.0,
            ..Default::default()
        };
        let rescaled = AnisotropicRescaler::new(&settings).rescale(&volume).unwrap();
        assert_eq!(rescaled.volume.data.shape(), &[5, 6, 3]);
        assert_eq!(rescaled.inverse_factors, vec![2.0, 2.0]);
    }

    #[test]
    fn test_rejects_unsupported_rank() {
        let volume = Volume::new(ArrayD::zeros(vec![3]), ElementType::Float32, false);
        let err = AnisotropicRescaler::new(&DiameterSettings::default())
            .rescale(&volume)
            .unwrap_err();
        assert!(matches!(
            err.downcast::<PipelineError>().unwrap(),
            PipelineError::UnsupportedRank(1)
        ));
    }

    #[test]
    fn test_empty_axis_is_rejected() {
        let volume = Volume::new(ArrayD::zeros(vec![0, 8]), ElementType::Float32, false);
        let err = AnisotropicRescaler::new(&DiameterSettings::default())
            .rescale(&volume)
            .unwrap_err();
        assert!(matches!(
            err.downcast::<PipelineError>().unwrap(),
            PipelineError::ShapeMismatch { .. }
        ));

        let labels = LabelImage::zeros(vec![4, 0]);
        assert!(LabelUnscaler.unscale(&labels, &[1.0, 1.0], &[4, 1]).is_err());
    }
}
