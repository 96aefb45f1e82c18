use crate::error::PipelineError;
use crate::pipeline::types::ObjectFeatureSet;
use anyhow::Result;
use serde::Serialize;

/// A contiguous run of timepoints handed to the tracking model together.
#[derive(Serialize, Debug, Clone, Copy)]
pub struct Window<'a> {
    /// Index of the first timepoint
    pub start: usize,
    pub sets: &'a [ObjectFeatureSet],
}

impl<'a> Window<'a> {
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn end(&self) -> usize {
        self.start + self.sets.len()
    }

    pub fn num_objects(&self) -> usize {
        self.sets.iter().map(|s| s.len()).sum()
    }
}

/// Slides a fixed-size window over aligned feature sets, one timepoint at a time.
pub struct WindowBuilder {
    window_size: usize,
}

impl WindowBuilder {
    pub fn new(window_size: usize) -> Result<Self> {
        if window_size == 0 {
            return Err(PipelineError::InvalidWindowSize.into());
        }
        Ok(Self { window_size })
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Number of windows for `num_timepoints`; zero if the series is shorter
    /// than one window.
    pub fn count(&self, num_timepoints: usize) -> usize {
        (num_timepoints + 1).saturating_sub(self.window_size)
    }

    pub fn windows<'a>(
        &self,
        sets: &'a [ObjectFeatureSet],
    ) -> impl Iterator<Item = Window<'a>> + 'a {
        sets.windows(self.window_size)
            .enumerate()
            .map(|(start, sets)| Window { start, sets })
    }
}
