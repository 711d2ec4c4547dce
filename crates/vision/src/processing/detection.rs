use ml_core::Detector;
use tracing::debug;
use video_ingest::Frame;

use crate::{
    annotation::{GLYPH_HEIGHT, annotate, clamp_to_image, draw_box, draw_tag, label_colour},
    error::PipelineError,
    pipeline::config::{DetectorFailurePolicy, StageKind},
    processing::{FrameProcessor, ScoredBox, detect_validated},
};

const BOX_THICKNESS: u32 = 2;
const UNLABELLED: &str = "object";

/// Draws every detection above the confidence threshold with its label.
pub struct ObjectDetection {
    stage: StageKind,
    detector: Box<dyn Detector>,
    confidence: f32,
    failure_policy: DetectorFailurePolicy,
}

impl ObjectDetection {
    /// `stage` names the stage in logs; `Darknet` and `Detect` share this
    /// implementation.
    pub fn new(stage: StageKind, detector: Box<dyn Detector>, confidence: f32) -> Self {
        Self {
            stage,
            detector,
            confidence,
            failure_policy: DetectorFailurePolicy::Propagate,
        }
    }

    pub fn with_failure_policy(mut self, policy: DetectorFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

/// `"<label> <percent>%"` with two decimals.
fn caption(detection: &ScoredBox) -> String {
    format!(
        "{} {:.2}%",
        detection.label.as_deref().unwrap_or(UNLABELLED),
        detection.score * 100.0
    )
}

/// Caption row above the box, or just inside it near the top edge.
fn caption_y(top: i32) -> i32 {
    if top - GLYPH_HEIGHT - 3 >= 0 {
        top - GLYPH_HEIGHT - 3
    } else {
        top + 3
    }
}

impl FrameProcessor for ObjectDetection {
    fn name(&self) -> &'static str {
        self.stage.name()
    }

    fn process(&mut self, mut frame: Frame) -> Result<Frame, PipelineError> {
        let stage = self.name();
        let detections =
            detect_validated(self.detector.as_mut(), &frame, self.failure_policy, stage)?;
        let kept: Vec<ScoredBox> = detections
            .into_iter()
            .filter(|d| d.score > self.confidence)
            .collect();
        if kept.is_empty() {
            return Ok(frame);
        }
        debug!("{stage}: {} detection(s) in frame {}", kept.len(), frame.sequence);

        annotate(&mut frame, |image| {
            for detection in &kept {
                let Some(visible) = clamp_to_image(image, &detection.bbox) else {
                    continue;
                };
                let colour = label_colour(detection.label.as_deref().unwrap_or(UNLABELLED));
                draw_box(image, &visible, colour, BOX_THICKNESS);
                draw_tag(
                    image,
                    visible.x_min,
                    caption_y(visible.y_min),
                    &caption(detection),
                    colour,
                );
            }
        })?;
        Ok(frame)
    }
}
