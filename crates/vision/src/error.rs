use ml_core::DetectorError;
use thiserror::Error;
use video_ingest::CaptureError;

/// Rejected configuration, reported before any frame is processed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown acquisition policy {0:?} (expected `queue` or `newest`)")]
    UnknownPolicy(String),
    #[error("unknown method {0:?} (one of abs_motion, rel_motion, darknet, ssd_obj, obj_tracker)")]
    UnknownStage(String),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("frame source unavailable")]
    SourceUnavailable(#[from] CaptureError),
    #[error("invalid configuration")]
    InvalidConfiguration(#[from] ConfigError),
    #[error("detector failed")]
    DetectorFailure(#[from] DetectorError),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("tracker state poisoned by a panicked stage")]
    TrackerPoisoned,
    #[error("frame sink failed")]
    Sink(#[source] anyhow::Error),
}

impl PipelineError {
    /// Whether rebuilding the source could clear the error.
    pub fn is_source_unavailable(&self) -> bool {
        matches!(self, PipelineError::SourceUnavailable(_))
    }
}
