use crate::pipeline::types::Volume;
use ndarray::{ArrayD, ArrayViewD, Axis};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PercentileRange {
    pub low: f64,
    pub high: f64,
}

impl Default for PercentileRange {
    fn default() -> Self {
        Self {
            low: 1.0,
            high: 99.8,
        }
    }
}

const EPS: f32 = 1e-20;

/// Percentile of already sorted values, linearly interpolated between ranks.
pub fn percentile(sorted: &[f32], p: f64) -> f32 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = (lo + 1).min(n - 1);
            let frac = (rank - lo as f64) as f32;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

/// Map the low percentile to 0 and the high percentile to 1. Values outside
/// the range are left unclipped.
pub fn normalize_percentile(data: &ArrayViewD<'_, f32>, range: PercentileRange) -> ArrayD<f32> {
    let mut sorted: Vec<f32> = data.iter().copied().collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let lo = percentile(&sorted, range.low);
    let hi = percentile(&sorted, range.high);
    let scale = hi - lo + EPS;
    data.mapv(|v| (v - lo) / scale)
}

/// Normalize a volume, each channel independently.
pub fn normalize_volume(volume: &Volume, range: PercentileRange) -> Volume {
    let data = if volume.has_channel {
        let channel_axis = Axis(volume.data.ndim() - 1);
        let mut out = ArrayD::<f32>::zeros(volume.data.raw_dim());
        for (channel, mut target) in volume
            .data
            .axis_iter(channel_axis)
            .zip(out.axis_iter_mut(channel_axis))
        {
            target.assign(&normalize_percentile(&channel, range));
        }
        out
    } else {
        normalize_percentile(&volume.data.view(), range)
    };
    Volume::new(data, volume.dtype, volume.has_channel)
}
