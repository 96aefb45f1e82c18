// Invocation requests
//
// The host describes each invocation in a small JSON document: which shared
// arrays to read and how to parametrize the models. Missing fields fall back
// to the defaults below.

use crate::error::PipelineError;
use crate::pipeline::detection::DetectionModel;
use crate::pipeline::normalize::PercentileRange;
use crate::pipeline::rescale::DiameterSettings;
use crate::pipeline::tracking::{TrackingMode, TrackingModel};
use crate::shm::ArrayRef;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_detect_id() -> String {
    "detect".to_string()
}

fn default_region_props_id() -> String {
    "region-props".to_string()
}

fn default_link_prediction_id() -> String {
    "predict-links".to_string()
}

fn default_prob_thresh() -> f64 {
    0.5
}

fn default_nms_thresh() -> f64 {
    0.4
}

fn default_window_size() -> usize {
    4
}

fn default_edge_threshold() -> f64 {
    0.05
}

fn default_normalization() -> f64 {
    1.0
}

fn default_label_image_name() -> String {
    "label_image".to_string()
}

fn default_edges_name() -> String {
    "edges".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DetectionRequest {
    #[serde(default = "default_detect_id")]
    pub id: String,
    pub image: ArrayRef,
    /// Last axis of `image` holds channels
    #[serde(default)]
    pub has_channel: bool,
    #[serde(default)]
    pub model: DetectionModel,
    #[serde(default = "default_prob_thresh")]
    pub prob_thresh: f64,
    #[serde(default = "default_nms_thresh")]
    pub nms_thresh: f64,
    #[serde(flatten)]
    pub diameters: DiameterSettings,
    #[serde(default)]
    pub normalize: PercentileRange,
    #[serde(default = "default_label_image_name")]
    pub output: String,
}

/// Names of the seven region property arrays.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RegionPropsArrays {
    pub labels: ArrayRef,
    pub timepoints: ArrayRef,
    pub coords: ArrayRef,
    pub diameter: ArrayRef,
    pub intensity: ArrayRef,
    pub inertia_tensor: ArrayRef,
    pub border_dist: ArrayRef,
}

impl RegionPropsArrays {
    pub const NAMES: [&'static str; 7] = [
        "labels",
        "timepoints",
        "coords",
        "diameter",
        "intensity",
        "inertia_tensor",
        "border_dist",
    ];

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &ArrayRef)> {
        Self::NAMES.into_iter().zip([
            &self.labels,
            &self.timepoints,
            &self.coords,
            &self.diameter,
            &self.intensity,
            &self.inertia_tensor,
            &self.border_dist,
        ])
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RegionPropsRequest {
    #[serde(default = "default_region_props_id")]
    pub id: String,
    pub image: ArrayRef,
    pub mask: ArrayRef,
    /// Timepoint recorded for every object of a single frame
    #[serde(default)]
    pub timepoint: i32,
    /// Leading axis of `image` and `mask` is time; outputs are padded per timepoint
    #[serde(default)]
    pub series: bool,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default)]
    pub normalize: PercentileRange,
    /// Prepended to every output array name
    #[serde(default)]
    pub output_prefix: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LinkPredictionRequest {
    #[serde(default = "default_link_prediction_id")]
    pub id: String,
    pub region_props: RegionPropsArrays,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_edge_threshold")]
    pub edge_threshold: f64,
    #[serde(default)]
    pub model: TrackingModel,
    #[serde(default)]
    pub mode: TrackingMode,
    #[serde(default = "default_normalization")]
    pub normalization: f64,
    #[serde(default = "default_edges_name")]
    pub output: String,
    /// Also write the edge table as CSV to this path
    #[serde(default)]
    pub export_csv: Option<PathBuf>,
}

impl LinkPredictionRequest {
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(PipelineError::InvalidWindowSize.into());
        }
        Ok(())
    }
}

impl RegionPropsRequest {
    pub fn validate(&self) -> Result<()> {
        if self.series && self.window_size == 0 {
            return Err(PipelineError::InvalidWindowSize.into());
        }
        Ok(())
    }
}

/// Read a request document.
pub fn load_request<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read request {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid request document {:?}", path))
}
