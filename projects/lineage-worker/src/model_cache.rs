// Pretrained weight cache
//
// Weights live under `<root>/<model path>/`. A non-empty folder is reused as
// is; otherwise the weights are downloaded once. Nothing is ever invalidated.
// Downloads land in a sibling `<model path>.download/` folder that is renamed
// into place only once complete, so an interrupted download is never reused.

use crate::error::PipelineError;
use crate::pipeline::detection::DetectionModel;
use crate::pipeline::tracking::TrackingModel;
use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Retrieves a weight archive from a remote location.
pub trait WeightFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Plain HTTP(S) download.
pub struct HttpFetcher;

impl WeightFetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let response = ureq::get(url)
            .call()
            .with_context(|| format!("Request to {} failed", url))?;
        let partial = dest.with_extension("part");
        {
            let mut file = fs::File::create(&partial)
                .with_context(|| format!("Failed to create {:?}", partial))?;
            io::copy(&mut response.into_reader(), &mut file)
                .with_context(|| format!("Download from {} was interrupted", url))?;
        }
        fs::rename(&partial, dest)?;
        Ok(())
    }
}

const WEIGHTS_FILE: &str = "model.zip";

pub struct ModelCache {
    root: PathBuf,
    fetcher: Box<dyn WeightFetcher>,
}

impl ModelCache {
    pub fn new(root: &Path, fetcher: Box<dyn WeightFetcher>) -> Self {
        Self {
            root: root.to_path_buf(),
            fetcher,
        }
    }

    pub fn default_root() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lineage-worker")
            .join("pretrained_models")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the installed weights for `name`, downloading them if needed.
    pub fn ensure(&self, name: &str, url: Option<&str>) -> Result<PathBuf> {
        let dir = self.root.join(name);
        if let Some(existing) = first_entry(&dir) {
            tracing::info!("Reusing model in folder: {:?}", existing);
            return Ok(existing);
        }

        let url = url.ok_or_else(|| PipelineError::ModelUnavailable(name.to_string()))?;
        let staging = staging_dir(&dir);
        if staging.exists() {
            tracing::warn!("Removing incomplete download in {:?}", staging);
            fs::remove_dir_all(&staging)
                .with_context(|| format!("Failed to clear {:?}", staging))?;
        }
        fs::create_dir_all(&staging)
            .with_context(|| format!("Failed to create model directory {:?}", staging))?;
        let staged = staging.join(WEIGHTS_FILE);
        tracing::info!("Downloading model from URL: {} to {:?}", url, dir);
        if let Err(e) = self.fetcher.fetch(url, &staged) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e.context(format!("Failed to download weights for '{}'", name)));
        }

        // Only leftovers of an interrupted download can be here
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("Failed to clear {:?}", dir))?;
        }
        fs::rename(&staging, &dir)
            .with_context(|| format!("Failed to move weights into {:?}", dir))?;
        Ok(dir.join(WEIGHTS_FILE))
    }

    /// Weights for a detection model, or `None` for built-in models.
    pub fn ensure_detection(&self, model: DetectionModel) -> Result<Option<PathBuf>> {
        match model.cache_path() {
            None => Ok(None),
            Some(path) => Ok(Some(self.ensure(&format!("stardist/{}", path), model.url())?)),
        }
    }

    pub fn ensure_tracking(&self, model: TrackingModel) -> Result<PathBuf> {
        let url = model.url();
        self.ensure(&format!("trackastra/{}", model.name()), Some(url.as_str()))
    }
}

fn staging_dir(dir: &Path) -> PathBuf {
    let mut name = dir.file_name().unwrap_or_default().to_os_string();
    name.push(".download");
    dir.with_file_name(name)
}

// Partial files are never installed weights
fn first_entry(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .find(|p| p.extension().map_or(true, |ext| ext != "part"))
}
