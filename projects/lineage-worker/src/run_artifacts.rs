// Invocation result manifest
//
// Written once, after every output array of an invocation has been written.
// Its presence tells the host that the outputs are complete.

use crate::shm::ArrayRef;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InvocationKind {
    Detect,
    RegionProps,
    PredictLinks,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InvocationResult {
    pub id: String,
    pub kind: InvocationKind,
    pub outputs: BTreeMap<String, ArrayRef>,
    pub messages_sent: usize,
    pub completed_at: DateTime<Utc>,
    /// Opaque model metadata, when the model produced any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl InvocationResult {
    pub fn new(id: &str, kind: InvocationKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            outputs: BTreeMap::new(),
            messages_sent: 0,
            completed_at: Utc::now(),
            details: None,
        }
    }

    pub fn with_output(mut self, name: &str, array: ArrayRef) -> Self {
        self.outputs.insert(name.to_string(), array);
        self
    }

    pub fn manifest_path(shm_root: &Path, id: &str) -> PathBuf {
        shm_root.join(format!("{}.result.json", id))
    }

    pub fn write(&self, shm_root: &Path) -> Result<PathBuf> {
        let path = Self::manifest_path(shm_root, &self.id);
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content).with_context(|| format!("Failed to write result {:?}", path))?;
        Ok(path)
    }
}
