use crate::error::PipelineError;
use crate::pipeline::normalize::{normalize_percentile, PercentileRange};
use crate::pipeline::types::SingleTimepointProps;
use anyhow::Result;
use ndarray::{Array1, Array2, ArrayViewD, Dimension};
use std::collections::BTreeMap;
use std::f64::consts::PI;

/// Computes per-object properties from a label mask and its image.
pub trait RegionMeasurer {
    fn measure(
        &self,
        image: &ArrayViewD<'_, f32>,
        mask: &ArrayViewD<'_, i32>,
        timepoint: i32,
    ) -> Result<SingleTimepointProps>;
}

struct Moments {
    count: f64,
    intensity: f64,
    sum: Vec<f64>,
    outer: Vec<f64>,
}

impl Moments {
    fn new(dims: usize) -> Self {
        Self {
            count: 0.0,
            intensity: 0.0,
            sum: vec![0.0; dims],
            outer: vec![0.0; dims * dims],
        }
    }

    fn add(&mut self, pos: &[usize], value: f32) {
        let dims = pos.len();
        self.count += 1.0;
        self.intensity += value as f64;
        for i in 0..dims {
            let pi = pos[i] as f64;
            self.sum[i] += pi;
            for j in 0..dims {
                self.outer[i * dims + j] += pi * pos[j] as f64;
            }
        }
    }

    fn centroid(&self) -> Vec<f64> {
        self.sum.iter().map(|s| s / self.count).collect()
    }

    /// `trace(C) * I - C` of the coordinate covariance `C`, row-major.
    fn inertia_tensor(&self, centroid: &[f64]) -> Vec<f64> {
        let dims = centroid.len();
        let cov: Vec<f64> = (0..dims * dims)
            .map(|k| {
                let (i, j) = (k / dims, k % dims);
                self.outer[k] / self.count - centroid[i] * centroid[j]
            })
            .collect();
        let trace: f64 = (0..dims).map(|i| cov[i * dims + i]).sum();
        (0..dims * dims)
            .map(|k| {
                let diagonal = if k / dims == k % dims { trace } else { 0.0 };
                diagonal - cov[k]
            })
            .collect()
    }
}

/// Diameter of the circle (2D) or sphere (3D) with the same area or volume.
pub fn equivalent_diameter(size: f64, dims: usize) -> f64 {
    if dims == 3 {
        (6.0 * size / PI).cbrt()
    } else {
        (4.0 * size / PI).sqrt()
    }
}

/// Region properties from image moments.
///
/// Coordinates and inertia tensors are emitted last axis first, the layout
/// in which the host stores them.
pub struct MomentMeasurer {
    pub normalize: PercentileRange,
}

impl MomentMeasurer {
    pub fn new(normalize: PercentileRange) -> Self {
        Self { normalize }
    }
}

impl RegionMeasurer for MomentMeasurer {
    fn measure(
        &self,
        image: &ArrayViewD<'_, f32>,
        mask: &ArrayViewD<'_, i32>,
        timepoint: i32,
    ) -> Result<SingleTimepointProps> {
        if image.shape() != mask.shape() {
            return Err(PipelineError::ShapeMismatch {
                what: "mask".to_string(),
                expected: image.shape().to_vec(),
                actual: mask.shape().to_vec(),
            }
            .into());
        }
        let dims = mask.ndim();
        if dims != 2 && dims != 3 {
            return Err(PipelineError::UnsupportedRank(dims).into());
        }

        let normalized = normalize_percentile(image, self.normalize);
        let mut regions: BTreeMap<i32, Moments> = BTreeMap::new();
        for ((pos, &label), &value) in mask.indexed_iter().zip(normalized.iter()) {
            if label <= 0 {
                continue;
            }
            regions
                .entry(label)
                .or_insert_with(|| Moments::new(dims))
                .add(pos.slice(), value);
        }

        let n = regions.len();
        let shape = mask.shape();
        let mut props = SingleTimepointProps::empty(dims, dims * dims);
        props.labels = Array1::from_iter(regions.keys().copied());
        props.timepoints = Array1::from_elem(n, timepoint);
        props.coords = Array2::zeros((n, dims));
        props.diameters = Array1::zeros(n);
        props.intensities = Array1::zeros(n);
        props.inertia_tensors = Array2::zeros((n, dims * dims));
        props.border_dists = Array1::zeros(n);

        for (row, moments) in regions.values().enumerate() {
            let centroid = moments.centroid();
            let tensor = moments.inertia_tensor(&centroid);

            for d in 0..dims {
                props.coords[[row, d]] = centroid[dims - 1 - d] as f32;
            }
            for a in 0..dims {
                for b in 0..dims {
                    props.inertia_tensors[[row, a * dims + b]] =
                        tensor[(dims - 1 - a) * dims + (dims - 1 - b)] as f32;
                }
            }
            props.diameters[row] = equivalent_diameter(moments.count, dims) as f32;
            props.intensities[row] = (moments.intensity / moments.count) as f32;
            props.border_dists[row] = centroid
                .iter()
                .zip(shape)
                .map(|(&c, &len)| c.min(len as f64 - 1.0 - c))
                .fold(f64::INFINITY, f64::min) as f32;
        }

        Ok(props)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{s, Array2, Array3};

    fn full_range() -> PercentileRange {
        PercentileRange {
            low: 0.0,
            high: 100.0,
        }
    }

    #[test]
    fn test_square_and_bar_properties() {
        let mut mask = Array2::<i32>::zeros((10, 12));
        let mut image = Array2::<f32>::zeros((10, 12));
        // 3x3 square centred at (2, 3)
        mask.slice_mut(s![1..4, 2..5]).fill(4);
        image.slice_mut(s![1..4, 2..5]).fill(10.0);
        // 1x3 bar along the last axis centred at (7, 9)
        mask.slice_mut(s![7..8, 8..11]).fill(9);
        image.slice_mut(s![7..8, 8..11]).fill(5.0);

        let props = MomentMeasurer::new(full_range())
            .measure(&image.view().into_dyn(), &mask.view().into_dyn(), 3)
            .unwrap();

        assert_eq!(props.labels.to_vec(), vec![4, 9]);
        assert_eq!(props.timepoints.to_vec(), vec![3, 3]);
        // last axis first
        assert_eq!(props.coords.row(0).to_vec(), vec![3.0, 2.0]);
        assert_eq!(props.coords.row(1).to_vec(), vec![9.0, 7.0]);

        assert_relative_eq!(props.diameters[0], (36.0 / PI).sqrt() as f32, epsilon = 1e-5);
        assert_relative_eq!(props.intensities[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(props.intensities[1], 0.5, epsilon = 1e-6);

        let two_thirds = 2.0f32 / 3.0;
        let square = props.inertia_tensors.row(0).to_vec();
        assert_relative_eq!(square[0], two_thirds, epsilon = 1e-5);
        assert_relative_eq!(square[3], two_thirds, epsilon = 1e-5);
        assert_relative_eq!(square[1], 0.0, epsilon = 1e-5);

        // Spread along the last axis only; the y term lands last once axes are reversed
        let bar = props.inertia_tensors.row(1).to_vec();
        assert_relative_eq!(bar[0], 0.0, epsilon = 1e-5);
        assert_relative_eq!(bar[3], two_thirds, epsilon = 1e-5);

        assert_relative_eq!(props.border_dists[0], 2.0);
        assert_relative_eq!(props.border_dists[1], 2.0);
    }

    #[test]
    fn test_volume_diameter() {
        let mut mask = Array3::<i32>::zeros((5, 6, 6));
        mask.slice_mut(s![1..3, 1..3, 1..3]).fill(1);
        let image = Array3::<f32>::ones((5, 6, 6));

        let props = MomentMeasurer::new(full_range())
            .measure(&image.view().into_dyn(), &mask.view().into_dyn(), 0)
            .unwrap();
        assert_eq!(props.len(), 1);
        assert_eq!(props.coords.ncols(), 3);
        assert_eq!(props.inertia_tensors.ncols(), 9);
        assert_relative_eq!(props.diameters[0], (48.0 / PI).cbrt() as f32, epsilon = 1e-5);
        assert_eq!(props.coords.row(0).to_vec(), vec![1.5, 1.5, 1.5]);
    }

    #[test]
    fn test_empty_mask_yields_no_objects() {
        let mask = Array2::<i32>::zeros((4, 4));
        let image = Array2::<f32>::zeros((4, 4));
        let props = MomentMeasurer::new(full_range())
            .measure(&image.view().into_dyn(), &mask.view().into_dyn(), 0)
            .unwrap();
        assert!(props.is_empty());
        assert_eq!(props.coords.shape(), &[0, 2]);
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let mask = Array2::<i32>::zeros((4, 4));
        let image = Array2::<f32>::zeros((4, 5));
        assert!(MomentMeasurer::new(full_range())
            .measure(&image.view().into_dyn(), &mask.view().into_dyn(), 0)
            .is_err());
    }
}
