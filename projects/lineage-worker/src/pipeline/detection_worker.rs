use crate::error::PipelineError;
use crate::pipeline::detection::{axes_for, DetectionConfig, Detector};
use crate::pipeline::normalize::normalize_volume;
use crate::pipeline::rescale::{AnisotropicRescaler, LabelUnscaler};
use crate::pipeline::types::{LabelImage, Volume};
use crate::run_context::DetectionRequest;
use crate::shm::ElementType;
use crate::status::InvocationStatus;
use anyhow::Result;
use std::time::Instant;

#[derive(Debug)]
pub struct DetectionOutcome {
    /// Labels at the resolution of the input volume
    pub labels: LabelImage,
    pub details: serde_json::Value,
}

/// Segment one volume: rescale to the model's object size, predict, and
/// bring the labels back to the original grid.
pub fn run_detection(
    request: &DetectionRequest,
    volume: &Volume,
    detector: &mut dyn Detector,
    status: &InvocationStatus<'_>,
) -> Result<DetectionOutcome> {
    let spatial_rank = volume.spatial_rank();
    if spatial_rank != 2 && spatial_rank != 3 {
        return Err(PipelineError::UnsupportedRank(spatial_rank).into());
    }
    if !request.model.supports_dims(spatial_rank) {
        return Err(PipelineError::IncompatibleModel {
            model: request.model.display_name(),
            dims: spatial_rank,
        }
        .into());
    }

    // Device setup problems only cost speed
    match detector.configure_device() {
        Ok(devices) if devices.is_empty() => {
            status.message("No accelerator devices found - running on CPU")
        }
        Ok(devices) => {
            status.message(&format!("Devices available: {}", devices.len()));
            for device in devices {
                status.message(&format!("  - {}", device));
            }
        }
        Err(e) => status.message(&format!("Could not set memory growth: {}", e)),
    }

    let d = &request.diameters;
    status.message(&format!(
        "Model expects nucleus size: XY={}px, Z={}px",
        d.expected_xy, d.expected_z
    ));
    status.message(&format!(
        "User estimates nucleus size: XY={}px, Z={}px",
        d.estimated_xy, d.estimated_z
    ));

    let rescaler = AnisotropicRescaler::new(d);
    let factors = rescaler.factors();
    status.message(&format!(
        "Scaling factors: XY={:.3}, Z={:.3}",
        factors.xy, factors.z
    ));

    status.begin_stage("rescale", 1);
    let start = Instant::now();
    let rescaled = rescaler.rescale(volume)?;
    status.message(&format!("Scaling volume with factors: {:?}", rescaled.zoom));
    status.message(&format!(
        "Scaled shape: {:?} -> {:?}",
        volume.data.shape(),
        rescaled.volume.data.shape()
    ));
    status.update_stage("rescale", 1, start.elapsed().as_secs_f64() * 1000.0);

    let normalized = normalize_volume(&rescaled.volume, request.normalize);
    status.message(&format!(
        "Image shape for prediction: {:?}",
        normalized.data.shape()
    ));
    if volume.dtype != ElementType::Float32 {
        status.message(&format!("Converting to float32 from {}", volume.dtype));
    }

    let image = normalized.data.view();
    let n_tiles = detector.guess_tiles(&image)?;
    status.message(&format!("Guessed tiles: {:?}", n_tiles));

    let config = DetectionConfig {
        axes: axes_for(spatial_rank, volume.has_channel)?,
        n_tiles,
        nms_thresh: request.nms_thresh,
        prob_thresh: request.prob_thresh,
    };

    status.message("Starting prediction");
    status.begin_stage("predict", 1);
    let start = Instant::now();
    let detection = detector.predict(&image, &config)?;
    status.update_stage("predict", 1, start.elapsed().as_secs_f64() * 1000.0);
    status.message("Prediction finished");

    if detection.labels.shape() != rescaled.rescaled_shape() {
        return Err(PipelineError::ShapeMismatch {
            what: "predicted label image".to_string(),
            expected: rescaled.rescaled_shape().to_vec(),
            actual: detection.labels.shape().to_vec(),
        }
        .into());
    }

    status.message(&format!(
        "Unscaling volume with factors: {:?}",
        rescaled.inverse_factors
    ));
    let labels = LabelUnscaler.unscale(
        &detection.labels,
        &rescaled.inverse_factors,
        &rescaled.original_shape,
    )?;
    status.message(&format!("Image size after unscaling: {:?}", labels.shape()));
    status.message("Done unscaling");

    Ok(DetectionOutcome {
        labels,
        details: detection.details,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::detection::{Detection, DetectionModel};
    use crate::pipeline::normalize::PercentileRange;
    use crate::pipeline::rescale::DiameterSettings;
    use crate::shm::ArrayRef;
    use crate::status::RecordingSink;
    use ndarray::{ArrayD, ArrayViewD, Dimension, IxDyn};

    /// Thresholds the image and gives every foreground pixel label 1.
    struct ThresholdDetector {
        fail_devices: bool,
        seen_shape: Option<Vec<usize>>,
        seen_config: Option<DetectionConfig>,
    }

    impl ThresholdDetector {
        fn new(fail_devices: bool) -> Self {
            Self {
                fail_devices,
                seen_shape: None,
                seen_config: None,
            }
        }
    }

    impl Detector for ThresholdDetector {
        fn configure_device(&mut self) -> Result<Vec<String>> {
            if self.fail_devices {
                anyhow::bail!("device busy");
            }
            Ok(vec!["GPU:0".to_string()])
        }

        fn guess_tiles(&mut self, image: &ArrayViewD<'_, f32>) -> Result<Vec<usize>> {
            Ok(vec![1; image.ndim()])
        }

        fn predict(
            &mut self,
            image: &ArrayViewD<'_, f32>,
            config: &DetectionConfig,
        ) -> Result<Detection> {
            self.seen_shape = Some(image.shape().to_vec());
            self.seen_config = Some(config.clone());
            Ok(Detection {
                labels: image.mapv(|v| if v > 0.5 { 1 } else { 0 }),
                details: serde_json::json!({"points": []}),
            })
        }
    }

    fn request(shape: &[usize], diameters: DiameterSettings) -> DetectionRequest {
        DetectionRequest {
            id: "detect".to_string(),
            image: ArrayRef {
                name: "image".to_string(),
                dtype: ElementType::Uint16,
                shape: shape.to_vec(),
            },
            has_channel: false,
            model: DetectionModel::Demo,
            prob_thresh: 0.5,
            nms_thresh: 0.4,
            diameters,
            normalize: PercentileRange::default(),
            output: "label_image".to_string(),
        }
    }

    fn blob_volume(shape: &[usize]) -> Volume {
        let data = ArrayD::from_shape_fn(IxDyn(shape), |idx| {
            let inside = idx
                .slice()
                .iter()
                .zip(shape)
                .all(|(&i, &n)| i >= n / 4 && i < 3 * n / 4);
            if inside {
                1000.0
            } else {
                10.0
            }
        });
        Volume::new(data, ElementType::Uint16, false)
    }

    #[test]
    fn test_labels_come_back_at_original_shape() {
        let shape = [6, 30, 22];
        let diameters = DiameterSettings {
            expected_xy: 30.0,
            estimated_xy: 12.0,
            expected_z: 10.0,
            estimated_z: 15.0,
        };
        let sink = RecordingSink::new();
        let status = InvocationStatus::new("detect", &sink);
        let mut detector = ThresholdDetector::new(false);

        let outcome = run_detection(
            &request(&shape, diameters),
            &blob_volume(&shape),
            &mut detector,
            &status,
        )
        .unwrap();

        assert_eq!(outcome.labels.shape(), &shape);
        // The model saw the rescaled volume
        assert_eq!(detector.seen_shape.unwrap(), vec![9, 12, 9]);
        let config = detector.seen_config.unwrap();
        assert_eq!(config.axes, "ZYX");
        assert_eq!(config.n_tiles, vec![1, 1, 1]);
        assert_eq!(config.prob_thresh, 0.5);
        assert!(outcome.labels.iter().all(|&l| l == 0 || l == 1));
        assert_eq!(outcome.labels[[3, 15, 11]], 1);
        assert_eq!(outcome.labels[[0, 0, 0]], 0);

        assert!(sink.contains("Scaling factors: XY=0.400, Z=1.500"));
        assert!(sink.contains("Devices available: 1"));
        assert!(sink.contains("Done unscaling"));
        assert!(status.stage("predict").is_some());
    }

    #[test]
    fn test_device_failure_is_not_fatal() {
        let shape = [16, 16];
        let sink = RecordingSink::new();
        let status = InvocationStatus::new("detect", &sink);
        let mut detector = ThresholdDetector::new(true);

        let outcome = run_detection(
            &request(&shape, DiameterSettings::default()),
            &blob_volume(&shape),
            &mut detector,
            &status,
        )
        .unwrap();
        assert_eq!(outcome.labels.shape(), &shape);
        assert!(sink.contains("Could not set memory growth: device busy"));
        assert_eq!(detector.seen_config.unwrap().axes, "YX");
    }

    #[test]
    fn test_incompatible_model_is_rejected() {
        let shape = [16, 16];
        let mut req = request(&shape, DiameterSettings::default());
        req.model = DetectionModel::Confocal3d;
        let sink = RecordingSink::new();
        let status = InvocationStatus::new("detect", &sink);

        let err = run_detection(
            &req,
            &blob_volume(&shape),
            &mut ThresholdDetector::new(false),
            &status,
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast::<PipelineError>().unwrap(),
            PipelineError::IncompatibleModel { dims: 2, .. }
        ));
    }
}
