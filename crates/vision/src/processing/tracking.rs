use std::sync::{Arc, Mutex};

use ml_core::Detector;
use tracing::debug;
use video_ingest::Frame;

use crate::{
    annotation::{GREEN, annotate, draw_box, draw_dot, draw_label},
    error::PipelineError,
    pipeline::config::DetectorFailurePolicy,
    processing::{FrameProcessor, detect_validated},
    tracker::{BoundingBox, CentroidTracker},
};

const BOX_THICKNESS: u32 = 2;
const DOT_RADIUS: i32 = 4;
const ID_OFFSET: i32 = 10;

/// Detection followed by centroid tracking.
///
/// The tracker sits behind a mutex so several loops can share one registry;
/// the lock is held for the whole `update` call.
pub struct ObjectTracking {
    detector: Box<dyn Detector>,
    tracker: Arc<Mutex<CentroidTracker>>,
    confidence: f32,
    failure_policy: DetectorFailurePolicy,
}

impl ObjectTracking {
    pub fn new(
        detector: Box<dyn Detector>,
        tracker: Arc<Mutex<CentroidTracker>>,
        confidence: f32,
    ) -> Self {
        Self {
            detector,
            tracker,
            confidence,
            failure_policy: DetectorFailurePolicy::Propagate,
        }
    }

    pub fn with_failure_policy(mut self, policy: DetectorFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn tracker(&self) -> Arc<Mutex<CentroidTracker>> {
        self.tracker.clone()
    }
}

impl FrameProcessor for ObjectTracking {
    fn name(&self) -> &'static str {
        "obj_tracker"
    }

    fn process(&mut self, mut frame: Frame) -> Result<Frame, PipelineError> {
        let stage = self.name();
        let detections =
            detect_validated(self.detector.as_mut(), &frame, self.failure_policy, stage)?;
        let boxes: Vec<BoundingBox> = detections
            .into_iter()
            .filter(|d| d.score > self.confidence)
            .map(|d| d.bbox)
            .collect();

        let objects = {
            let mut tracker = self.tracker.lock().map_err(|_| PipelineError::TrackerPoisoned)?;
            tracker.update(&boxes)
        };
        metrics::gauge!("vision_tracked_objects").set(objects.len() as f64);
        debug!(
            "obj_tracker: {} box(es), {} tracked object(s) in frame {}",
            boxes.len(),
            objects.len(),
            frame.sequence
        );

        if boxes.is_empty() && objects.is_empty() {
            return Ok(frame);
        }
        annotate(&mut frame, |image| {
            for bbox in &boxes {
                draw_box(image, bbox, GREEN, BOX_THICKNESS);
            }
            for (id, centroid) in &objects {
                draw_label(
                    image,
                    centroid.x - ID_OFFSET,
                    centroid.y - ID_OFFSET,
                    &format!("ID {id}"),
                    GREEN,
                );
                draw_dot(image, *centroid, DOT_RADIUS, GREEN);
            }
        })?;
        Ok(frame)
    }
}
