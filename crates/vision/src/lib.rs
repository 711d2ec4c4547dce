//! Frame processing for live video: motion and object detection stages,
//! centroid tracking, frame sinks, and the loop that drives them.
//!
//! - `tracker`: persistent ids from per-frame boxes.
//! - `processing`: the stages behind [`FrameProcessor`].
//! - `annotation`: drawing primitives shared by the stages.
//! - `sink`: JPEG encoding and the shared latest-frame slot.
//! - `pipeline`: the processing loop, configuration, and telemetry setup.

pub mod annotation;
pub mod error;
pub mod pipeline;
pub mod processing;
pub mod sink;
pub mod tracker;

pub use error::{ConfigError, PipelineError};
pub use pipeline::{
    Pipeline, PipelineStats,
    config::{
        DetectorFailurePolicy, MotionOptions, StageKind, TelemetryOptions, VisionCliArgs,
        VisionConfig,
    },
    telemetry,
};
pub use processing::{FrameProcessor, build_processor};
pub use sink::{ChannelSink, FramePacket, FrameSink, FrameStats, JpegSink, LatestFrame};
pub use tracker::{BoundingBox, Centroid, CentroidTracker, TrackedObject};
