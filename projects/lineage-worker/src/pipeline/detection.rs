use crate::error::PipelineError;
use crate::pipeline::runner::{ModelRunner, ScratchFiles};
use crate::pipeline::types::LabelImage;
use anyhow::{Context, Result};
use ndarray::ArrayViewD;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Pretrained instance segmentation models known to the worker.
///
/// Requests may name a model by registry key or by model name.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(try_from = "String")]
pub enum DetectionModel {
    #[serde(rename = "PLANT_NUCLEI_3D")]
    PlantNuclei3d,
    #[serde(rename = "FLUO_2D")]
    Fluo2d,
    #[serde(rename = "SOSPIM_3D")]
    Sospim3d,
    #[serde(rename = "CONFOCAL_3D")]
    Confocal3d,
    #[serde(rename = "SPINNING_DISK_3D")]
    SpinningDisk3d,
    #[serde(rename = "DEMO")]
    #[default]
    Demo,
}

impl DetectionModel {
    pub const ALL: [DetectionModel; 6] = [
        DetectionModel::PlantNuclei3d,
        DetectionModel::Fluo2d,
        DetectionModel::Sospim3d,
        DetectionModel::Confocal3d,
        DetectionModel::SpinningDisk3d,
        DetectionModel::Demo,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            DetectionModel::PlantNuclei3d => "PLANT_NUCLEI_3D",
            DetectionModel::Fluo2d => "FLUO_2D",
            DetectionModel::Sospim3d => "SOSPIM_3D",
            DetectionModel::Confocal3d => "CONFOCAL_3D",
            DetectionModel::SpinningDisk3d => "SPINNING_DISK_3D",
            DetectionModel::Demo => "DEMO",
        }
    }

    pub fn model_name(&self) -> &'static str {
        match self {
            DetectionModel::PlantNuclei3d => "StarDist Plant Nuclei 3D ResNet",
            DetectionModel::Fluo2d => "Fluorescence Nuclei Segmentation",
            DetectionModel::Sospim3d => "SoSPIM Nuclei",
            DetectionModel::Confocal3d => "Confocal Nuclei",
            DetectionModel::SpinningDisk3d => "Spinning Disk Nuclei",
            DetectionModel::Demo => "Default Model",
        }
    }

    /// Folder name inside the weight cache. Built-in models have none.
    pub fn cache_path(&self) -> Option<&'static str> {
        match self {
            DetectionModel::PlantNuclei3d => Some("plant-nuclei-3d"),
            DetectionModel::Fluo2d => Some("fluo-2d"),
            DetectionModel::Sospim3d => Some("sospim-nuclei-3d"),
            DetectionModel::Confocal3d => Some("confocal-nuclei-3d"),
            DetectionModel::SpinningDisk3d => Some("spinning-disk-nuclei-3d"),
            DetectionModel::Demo => None,
        }
    }

    /// `Some(true)` for 2D-only, `Some(false)` for 3D-only, `None` for both.
    pub fn is_2d(&self) -> Option<bool> {
        match self {
            DetectionModel::Fluo2d => Some(true),
            DetectionModel::Demo => None,
            _ => Some(false),
        }
    }

    pub fn url(&self) -> Option<&'static str> {
        match self {
            DetectionModel::Sospim3d => {
                Some("https://zenodo.org/records/10518151/files/model_sospim.zip?download=1")
            }
            DetectionModel::Confocal3d => {
                Some("https://zenodo.org/records/10518151/files/model_confocal.zip?download=1")
            }
            DetectionModel::SpinningDisk3d => {
                Some("https://zenodo.org/records/10518151/files/model_spinning.zip?download=1")
            }
            _ => None,
        }
    }

    pub fn supports_dims(&self, dims: usize) -> bool {
        match self.is_2d() {
            Some(true) => dims == 2,
            Some(false) => dims == 3,
            None => dims == 2 || dims == 3,
        }
    }

    pub fn display_name(&self) -> String {
        let dimensionality = match self.is_2d() {
            None => " (2D/3D)",
            Some(true) => " (2D)",
            Some(false) => " (3D)",
        };
        format!("{}{}", self.model_name().replace("StarDist ", ""), dimensionality)
    }

    /// Look a model up by registry key or model name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL.into_iter().find(|m| {
            m.key().eq_ignore_ascii_case(name) || m.model_name().eq_ignore_ascii_case(name)
        })
    }
}

impl TryFrom<String> for DetectionModel {
    type Error = String;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::from_name(&name).ok_or_else(|| format!("unknown detection model '{}'", name))
    }
}

/// Parameters handed to the model for one prediction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DetectionConfig {
    /// `YX` or `ZYX`, with a trailing `C` for multi-channel images
    pub axes: String,
    pub n_tiles: Vec<usize>,
    pub nms_thresh: f64,
    pub prob_thresh: f64,
}

pub fn axes_for(spatial_rank: usize, has_channel: bool) -> Result<String> {
    let spatial = match spatial_rank {
        2 => "YX",
        3 => "ZYX",
        other => return Err(PipelineError::UnsupportedRank(other).into()),
    };
    Ok(if has_channel {
        format!("{}C", spatial)
    } else {
        spatial.to_string()
    })
}

/// Model output at the resolution it was given.
#[derive(Debug, Clone)]
pub struct Detection {
    pub labels: LabelImage,
    /// Opaque model metadata, passed through untouched
    pub details: serde_json::Value,
}

/// Instance segmentation backend.
pub trait Detector {
    /// Prepare compute devices and describe them. Failures are not fatal to callers.
    fn configure_device(&mut self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Model's own estimate of how to tile the image.
    fn guess_tiles(&mut self, image: &ArrayViewD<'_, f32>) -> Result<Vec<usize>>;

    fn predict(&mut self, image: &ArrayViewD<'_, f32>, config: &DetectionConfig) -> Result<Detection>;
}

#[derive(Serialize)]
struct DetectJob<'a> {
    task: &'a str,
    model: &'a str,
    weights: Option<&'a Path>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<&'a Path>,
    #[serde(skip_serializing_if = "Option::is_none")]
    labels: Option<&'a Path>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a Path>,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<&'a DetectionConfig>,
}

/// Detector backed by an external runner program.
pub struct CommandDetector {
    runner: ModelRunner,
    model: DetectionModel,
    weights: Option<PathBuf>,
}

impl CommandDetector {
    pub fn new(runner: ModelRunner, model: DetectionModel, weights: Option<PathBuf>) -> Self {
        Self {
            runner,
            model,
            weights,
        }
    }

    fn job<'a>(&'a self, task: &'a str) -> DetectJob<'a> {
        DetectJob {
            task,
            model: self.model.key(),
            weights: self.weights.as_deref(),
            input: None,
            labels: None,
            details: None,
            config: None,
        }
    }
}

impl Detector for CommandDetector {
    fn configure_device(&mut self) -> Result<Vec<String>> {
        let stdout = self.runner.run("devices", &self.job("configure_device"))?;
        Ok(stdout
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string())
            .collect())
    }

    fn guess_tiles(&mut self, image: &ArrayViewD<'_, f32>) -> Result<Vec<usize>> {
        let mut scratch = ScratchFiles::new();
        let input = scratch.track(self.runner.write_array("tiles.input", image)?);
        let job = DetectJob {
            input: Some(&input),
            ..self.job("guess_tiles")
        };
        let stdout = self.runner.run("tiles", &job)?;
        let tiles: Vec<usize> = serde_json::from_str(stdout.trim())
            .with_context(|| format!("Runner returned invalid tile counts: {:?}", stdout.trim()))?;
        Ok(tiles)
    }

    fn predict(&mut self, image: &ArrayViewD<'_, f32>, config: &DetectionConfig) -> Result<Detection> {
        let mut scratch = ScratchFiles::new();
        let input = scratch.track(self.runner.write_array("predict.input", image)?);
        let labels_path = scratch.track(self.runner.scratch_path("predict", "labels.npy"));
        let details_path = scratch.track(self.runner.scratch_path("predict", "details.json"));
        let job = DetectJob {
            input: Some(&input),
            labels: Some(&labels_path),
            details: Some(&details_path),
            config: Some(config),
            ..self.job("predict")
        };
        self.runner.run("predict", &job)?;

        if !labels_path.exists() {
            return Err(PipelineError::MissingOutput("label image".to_string()).into());
        }
        let labels: LabelImage = self.runner.read_output(&labels_path)?;
        let details = match std::fs::read_to_string(&details_path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or(serde_json::Value::Null),
            Err(_) => serde_json::Value::Null,
        };
        Ok(Detection { labels, details })
    }
}
