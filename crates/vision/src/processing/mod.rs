//! Per-frame processing stages.
//!
//! Every stage implements [`FrameProcessor`] and keeps its own private state
//! (reference frames, tracker handle, detector). Stages draw onto the frame
//! they are handed and return it with unchanged dimensions.

mod detection;
mod motion;
mod tracking;

use std::sync::{Arc, Mutex};

use ml_core::{Detection, Detector};
use tracing::warn;
use video_ingest::{Frame, FrameProvider};

pub use detection::ObjectDetection;
pub use motion::{AbsoluteMotion, RelativeMotion};
pub use tracking::ObjectTracking;

use crate::{
    error::{ConfigError, PipelineError},
    pipeline::config::{DetectorFailurePolicy, StageKind, VisionConfig},
    tracker::{BoundingBox, CentroidTracker},
};

/// One processing step per frame.
pub trait FrameProcessor: Send {
    /// Stage name used in logs and metric labels.
    fn name(&self) -> &'static str;

    fn process(&mut self, frame: Frame) -> Result<Frame, PipelineError>;
}

impl FrameProcessor for Box<dyn FrameProcessor> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn process(&mut self, frame: Frame) -> Result<Frame, PipelineError> {
        (**self).process(frame)
    }
}

/// Detection that passed boundary validation.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoredBox {
    pub bbox: BoundingBox,
    pub score: f32,
    pub label: Option<String>,
}

/// Drop non-finite detections and round the rest to integer boxes with
/// ordered corners.
///
/// Coordinates are not clamped to the frame, so a box's centroid stays its
/// true midpoint even when the box reaches past the edge. Drawing clips.
pub fn validate_detections(detections: Vec<Detection>) -> Vec<ScoredBox> {
    let mut valid = Vec::with_capacity(detections.len());
    for detection in detections {
        if !detection.is_finite() {
            warn!("discarding non-finite detection {detection:?}");
            continue;
        }
        let [x0, y0, x1, y1] = detection.bbox;
        valid.push(ScoredBox {
            bbox: BoundingBox::new(
                x0.min(x1).round() as i32,
                y0.min(y1).round() as i32,
                x0.max(x1).round() as i32,
                y0.max(y1).round() as i32,
            ),
            score: detection.score,
            label: detection.label,
        });
    }
    valid
}

/// Run the detector and apply the configured failure policy.
pub(crate) fn detect_validated(
    detector: &mut dyn Detector,
    frame: &Frame,
    policy: DetectorFailurePolicy,
    stage: &'static str,
) -> Result<Vec<ScoredBox>, PipelineError> {
    match detector.detect(frame) {
        Ok(detections) => Ok(validate_detections(detections)),
        Err(err) => match policy {
            DetectorFailurePolicy::Propagate => Err(err.into()),
            DetectorFailurePolicy::Degrade => {
                warn!(
                    "{stage}: detector failed on frame {}, continuing without detections: {err}",
                    frame.sequence
                );
                metrics::counter!("vision_detector_failures_total", "stage" => stage).increment(1);
                Ok(Vec::new())
            }
        },
    }
}

/// Build the stage selected by `config`.
///
/// The absolute motion stage takes its reference from the next frame of
/// `provider`. Detection stages require `detector`.
pub fn build_processor(
    config: &VisionConfig,
    detector: Option<Box<dyn Detector>>,
    provider: &mut dyn FrameProvider,
) -> Result<Box<dyn FrameProcessor>, PipelineError> {
    let require_detector = |detector: Option<Box<dyn Detector>>| {
        detector.ok_or_else(|| {
            PipelineError::InvalidConfiguration(ConfigError::Invalid(format!(
                "`{}` needs a detector backend",
                config.stage
            )))
        })
    };

    Ok(match config.stage {
        StageKind::AbsoluteMotion => {
            let reference = provider.next_frame()?;
            Box::new(AbsoluteMotion::new(&reference, config.motion))
        }
        StageKind::RelativeMotion => Box::new(RelativeMotion::new(config.motion)),
        StageKind::Darknet | StageKind::Detect => Box::new(
            ObjectDetection::new(config.stage, require_detector(detector)?, config.confidence)
                .with_failure_policy(config.detector_failure),
        ),
        StageKind::ObjectTracker => {
            let tracker = Arc::new(Mutex::new(CentroidTracker::new(config.max_disappeared)));
            Box::new(
                ObjectTracking::new(require_detector(detector)?, tracker, config.confidence)
                    .with_failure_policy(config.detector_failure),
            )
        }
    })
}
