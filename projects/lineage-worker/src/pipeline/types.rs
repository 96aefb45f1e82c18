use crate::error::PipelineError;
use crate::shm::ElementType;
use anyhow::Result;
use ndarray::{s, Array1, Array2, Array3, ArrayD, Axis};
use serde::Serialize;
use std::collections::BTreeMap;

/// Integer label image: 0 is background, positive values identify objects.
pub type LabelImage = ArrayD<i32>;

/// Raw image data for one timepoint, held as `f32` regardless of the host type.
#[derive(Debug, Clone)]
pub struct Volume {
    pub data: ArrayD<f32>,
    /// Element type of the array supplied by the host
    pub dtype: ElementType,
    /// Whether the last axis is a channel axis
    pub has_channel: bool,
}

impl Volume {
    pub fn new(data: ArrayD<f32>, dtype: ElementType, has_channel: bool) -> Self {
        Self {
            data,
            dtype,
            has_channel,
        }
    }

    pub fn spatial_rank(&self) -> usize {
        if self.has_channel {
            self.data.ndim().saturating_sub(1)
        } else {
            self.data.ndim()
        }
    }

    pub fn spatial_shape(&self) -> &[usize] {
        &self.data.shape()[..self.spatial_rank()]
    }
}

/// Per-object measurements carried alongside labels and coordinates.
///
/// Declaration order is the order in which features are handed to the
/// tracking model.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    #[serde(rename = "equivalent_diameter_area")]
    EquivalentDiameter,
    IntensityMean,
    InertiaTensor,
    BorderDist,
}

impl FeatureKind {
    pub fn name(&self) -> &'static str {
        match self {
            FeatureKind::EquivalentDiameter => "equivalent_diameter_area",
            FeatureKind::IntensityMean => "intensity_mean",
            FeatureKind::InertiaTensor => "inertia_tensor",
            FeatureKind::BorderDist => "border_dist",
        }
    }

    /// Vector features stored last-axis-first by the host.
    pub fn is_axis_reversed(&self) -> bool {
        matches!(self, FeatureKind::InertiaTensor)
    }
}

/// Aligned per-object measurements for one timepoint.
///
/// Every array has one row per object and row `i` refers to the same object
/// everywhere. Rows are sorted by ascending label.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ObjectFeatureSet {
    pub timepoint: usize,
    pub labels: Array1<i32>,
    /// `[objects, dim]`, first spatial axis first
    pub coords: Array2<f32>,
    pub timepoints: Array1<i32>,
    pub features: BTreeMap<FeatureKind, Array2<f32>>,
}

impl ObjectFeatureSet {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn feature(&self, kind: FeatureKind) -> Option<&Array2<f32>> {
        self.features.get(&kind)
    }
}

/// Region measurements of a single timepoint, one entry per object.
///
/// Coordinates and inertia tensors are in storage order (last axis first).
#[derive(Debug, Clone, PartialEq)]
pub struct SingleTimepointProps {
    pub labels: Array1<i32>,
    pub timepoints: Array1<i32>,
    /// `[objects, dim]`
    pub coords: Array2<f32>,
    pub diameters: Array1<f32>,
    pub intensities: Array1<f32>,
    /// `[objects, dim * dim]`
    pub inertia_tensors: Array2<f32>,
    pub border_dists: Array1<f32>,
}

impl SingleTimepointProps {
    pub fn empty(coord_dims: usize, tensor_dims: usize) -> Self {
        Self {
            labels: Array1::zeros(0),
            timepoints: Array1::zeros(0),
            coords: Array2::zeros((0, coord_dims)),
            diameters: Array1::zeros(0),
            intensities: Array1::zeros(0),
            inertia_tensors: Array2::zeros((0, tensor_dims)),
            border_dists: Array1::zeros(0),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Padded region measurements for a whole time series.
///
/// Each column holds one timepoint; unused slots carry label 0.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionProps {
    /// `[capacity, timepoints]`
    pub labels: Array2<i32>,
    /// `[capacity, timepoints]`
    pub timepoints: Array2<i32>,
    /// `[dim, capacity, timepoints]`
    pub coords: Array3<f32>,
    /// `[capacity, timepoints]`
    pub diameters: Array2<f32>,
    /// `[capacity, timepoints]`
    pub intensities: Array2<f32>,
    /// `[dim * dim, capacity, timepoints]`
    pub inertia_tensors: Array3<f32>,
    /// `[capacity, timepoints]`
    pub border_dists: Array2<f32>,
}

impl RegionProps {
    pub fn capacity(&self) -> usize {
        self.labels.shape()[0]
    }

    pub fn num_timepoints(&self) -> usize {
        self.labels.shape()[1]
    }

    pub fn coord_dims(&self) -> usize {
        self.coords.shape()[0]
    }

    /// Build padded arrays from loosely shaped inputs, checking they agree.
    pub fn from_arrays(
        labels: ArrayD<i32>,
        timepoints: ArrayD<i32>,
        coords: ArrayD<f32>,
        diameters: ArrayD<f32>,
        intensities: ArrayD<f32>,
        inertia_tensors: ArrayD<f32>,
        border_dists: ArrayD<f32>,
    ) -> Result<Self> {
        let labels = labels.into_dimensionality::<ndarray::Ix2>()?;
        let expected = labels.shape().to_vec();
        let check = |what: &str, actual: &[usize]| -> Result<()> {
            if actual != expected.as_slice() {
                return Err(PipelineError::ShapeMismatch {
                    what: what.to_string(),
                    expected: expected.clone(),
                    actual: actual.to_vec(),
                }
                .into());
            }
            Ok(())
        };

        let timepoints = timepoints.into_dimensionality::<ndarray::Ix2>()?;
        check("timepoints", timepoints.shape())?;
        let diameters = diameters.into_dimensionality::<ndarray::Ix2>()?;
        check("diameter", diameters.shape())?;
        let intensities = intensities.into_dimensionality::<ndarray::Ix2>()?;
        check("intensity", intensities.shape())?;
        let border_dists = border_dists.into_dimensionality::<ndarray::Ix2>()?;
        check("border_dist", border_dists.shape())?;
        let coords = coords.into_dimensionality::<ndarray::Ix3>()?;
        check("coords", &coords.shape()[1..])?;
        let inertia_tensors = inertia_tensors.into_dimensionality::<ndarray::Ix3>()?;
        check("inertia_tensor", &inertia_tensors.shape()[1..])?;

        Ok(Self {
            labels,
            timepoints,
            coords,
            diameters,
            intensities,
            inertia_tensors,
            border_dists,
        })
    }

    /// Pack per-timepoint measurements into padded arrays.
    ///
    /// `None` marks a timepoint without objects. Runs of empty timepoints
    /// as long as `window_size` cannot be bridged by a single window and are
    /// rejected.
    pub fn pack(per_timepoint: &[Option<SingleTimepointProps>], window_size: usize) -> Result<Self> {
        if per_timepoint.is_empty() {
            return Err(PipelineError::NoTimepoints.into());
        }

        let mut empty_run = 0;
        for (t, props) in per_timepoint.iter().enumerate() {
            if props.as_ref().map(|p| p.is_empty()).unwrap_or(true) {
                empty_run += 1;
                if empty_run >= window_size {
                    return Err(PipelineError::TooManyEmptyFrames {
                        run: empty_run,
                        timepoint: t,
                        window_size,
                    }
                    .into());
                }
            } else {
                empty_run = 0;
            }
        }

        let present: Vec<&SingleTimepointProps> = per_timepoint.iter().flatten().collect();
        let capacity = present.iter().map(|p| p.len()).max().unwrap_or(0);
        if capacity == 0 {
            return Err(PipelineError::EmptyRegionProps.into());
        }
        let coord_dims = present[0].coords.ncols();
        let tensor_dims = present[0].inertia_tensors.ncols();
        let num_timepoints = per_timepoint.len();

        let mut packed = Self {
            labels: Array2::zeros((capacity, num_timepoints)),
            timepoints: Array2::zeros((capacity, num_timepoints)),
            coords: Array3::zeros((coord_dims, capacity, num_timepoints)),
            diameters: Array2::zeros((capacity, num_timepoints)),
            intensities: Array2::zeros((capacity, num_timepoints)),
            inertia_tensors: Array3::zeros((tensor_dims, capacity, num_timepoints)),
            border_dists: Array2::zeros((capacity, num_timepoints)),
        };

        for (t, props) in per_timepoint.iter().enumerate() {
            let Some(props) = props else { continue };
            let n = props.len();
            if props.coords.ncols() != coord_dims || props.inertia_tensors.ncols() != tensor_dims {
                return Err(PipelineError::ShapeMismatch {
                    what: format!("region props at timepoint {}", t),
                    expected: vec![coord_dims, tensor_dims],
                    actual: vec![props.coords.ncols(), props.inertia_tensors.ncols()],
                }
                .into());
            }
            packed.labels.slice_mut(s![..n, t]).assign(&props.labels);
            packed.timepoints.slice_mut(s![..n, t]).assign(&props.timepoints);
            packed.diameters.slice_mut(s![..n, t]).assign(&props.diameters);
            packed.intensities.slice_mut(s![..n, t]).assign(&props.intensities);
            packed.border_dists.slice_mut(s![..n, t]).assign(&props.border_dists);
            packed
                .coords
                .slice_mut(s![.., ..n, t])
                .assign(&props.coords.t());
            packed
                .inertia_tensors
                .slice_mut(s![.., ..n, t])
                .assign(&props.inertia_tensors.t());
        }

        Ok(packed)
    }

    /// Labels of one timepoint column.
    pub fn label_column(&self, t: usize) -> ndarray::ArrayView1<'_, i32> {
        self.labels.index_axis(Axis(1), t)
    }
}
