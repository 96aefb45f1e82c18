use thiserror::Error;

/// Failures that abort an invocation and cross the process boundary.
///
/// Recoverable conditions (invalid diameters, device setup problems, element
/// type mismatches) never surface here; they are absorbed where they occur.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported number of spatial axes: {0} (expected 2 or 3)")]
    UnsupportedRank(usize),

    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("no timepoints provided")]
    NoTimepoints,

    #[error("no objects found in any timepoint")]
    EmptyRegionProps,

    #[error(
        "found {run} consecutive frames without objects ending at timepoint {timepoint}; \
         at most {} are allowed with window size {window_size}", .window_size.saturating_sub(1)
    )]
    TooManyEmptyFrames {
        run: usize,
        timepoint: usize,
        window_size: usize,
    },

    #[error("model '{model}' does not support {dims} spatial dimensions")]
    IncompatibleModel { model: String, dims: usize },

    #[error("window size must be at least 1")]
    InvalidWindowSize,

    #[error("external model did not produce expected output: {0}")]
    MissingOutput(String),

    #[error("model '{0}' is not cached and has no download location")]
    ModelUnavailable(String),
}
