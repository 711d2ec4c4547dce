//! Configuration parsing for the vision pipeline.
//!
//! This module owns translation of CLI arguments into a `VisionConfig` struct
//! which downstream stages use without re-parsing flags.

use std::{fmt, path::PathBuf, str::FromStr};

use clap::Args;
use ml_core::Preprocessing;
use video_ingest::{AcquisitionPolicy, OverflowPolicy, QueueBound, SourceDescriptor};

use crate::error::ConfigError;

/// Processing stage applied to every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageKind {
    /// Difference against the first frame.
    AbsoluteMotion,
    /// Difference against the previous frame.
    RelativeMotion,
    /// Detection with the darknet-style default threshold.
    Darknet,
    /// Detection with the SSD-style default threshold.
    Detect,
    /// Detection followed by centroid tracking.
    ObjectTracker,
}

impl StageKind {
    pub fn name(self) -> &'static str {
        match self {
            StageKind::AbsoluteMotion => "abs_motion",
            StageKind::RelativeMotion => "rel_motion",
            StageKind::Darknet => "darknet",
            StageKind::Detect => "ssd_obj",
            StageKind::ObjectTracker => "obj_tracker",
        }
    }

    pub fn needs_detector(self) -> bool {
        matches!(
            self,
            StageKind::Darknet | StageKind::Detect | StageKind::ObjectTracker
        )
    }

    /// Confidence threshold used when `--confidence` is not given.
    pub fn default_confidence(self) -> f32 {
        match self {
            StageKind::Detect => 0.2,
            _ => 0.5,
        }
    }

    /// Input preparation for the model paired with this stage. The tracker
    /// runs a face SSD at frame size; the detection stages run MobileNet-SSD.
    pub fn preprocessing(self) -> Preprocessing {
        match self {
            StageKind::ObjectTracker => Preprocessing::full_frame_mean(),
            _ => Preprocessing::mobilenet_ssd(),
        }
    }
}

impl FromStr for StageKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abs_motion" => Ok(StageKind::AbsoluteMotion),
            "rel_motion" => Ok(StageKind::RelativeMotion),
            "darknet" => Ok(StageKind::Darknet),
            "ssd_obj" | "detect" => Ok(StageKind::Detect),
            "obj_tracker" => Ok(StageKind::ObjectTracker),
            _ => Err(ConfigError::UnknownStage(s.to_string())),
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a detection stage does when the detector errors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DetectorFailurePolicy {
    /// Return the error and halt the loop.
    #[default]
    Propagate,
    /// Log it and treat the frame as having no detections.
    Degrade,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Parameters shared by both motion stages.
pub struct MotionOptions {
    /// Regions with fewer pixels are ignored.
    pub min_area: u32,
    /// Difference threshold; pixels strictly above it count as motion.
    pub tolerance: u8,
}

impl Default for MotionOptions {
    fn default() -> Self {
        Self {
            min_area: 500,
            tolerance: 50,
        }
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Lower the default log filter to `debug`.
    pub verbose: bool,
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage in the pipeline.
pub struct VisionConfig {
    pub policy: AcquisitionPolicy,
    pub source: SourceDescriptor,
    pub stage: StageKind,
    /// Capture width streamed by the ingest component.
    pub width: u32,
    /// Capture height streamed by the ingest component.
    pub height: u32,
    /// Only used by the queued policy.
    pub queue_bound: QueueBound,
    pub motion: MotionOptions,
    pub confidence: f32,
    pub max_disappeared: u32,
    /// Detector model, required by detection stages.
    pub model_path: Option<PathBuf>,
    /// One class name per line; defaults to the SSD VOC classes.
    pub labels_path: Option<PathBuf>,
    pub detector_failure: DetectorFailurePolicy,
    /// JPEG quality used by the encoder.
    pub jpeg_quality: u8,
    /// Rewritten with the latest encoded frame after every iteration.
    pub snapshot_path: Option<PathBuf>,
    /// Rebuild attempts after the source becomes unavailable.
    pub reconnect_attempts: u32,
    pub telemetry: TelemetryOptions,
}

impl VisionConfig {
    /// Defaults for everything but the three required selections.
    pub fn new(policy: AcquisitionPolicy, source: SourceDescriptor, stage: StageKind) -> Self {
        Self {
            policy,
            source,
            stage,
            width: 640,
            height: 480,
            queue_bound: QueueBound::Unbounded,
            motion: MotionOptions::default(),
            confidence: stage.default_confidence(),
            max_disappeared: 50,
            model_path: None,
            labels_path: None,
            detector_failure: DetectorFailurePolicy::Propagate,
            jpeg_quality: 85,
            snapshot_path: None,
            reconnect_attempts: 0,
            telemetry: TelemetryOptions::default(),
        }
    }
}

/// CLI arguments accepted by the monitor.
#[derive(Debug, Args)]
pub struct VisionCliArgs {
    /// Frame acquisition policy: `queue` or `newest`.
    #[arg(value_name = "CAMERA_MODE")]
    pub camera_mode: String,
    /// `local`, a device index, `/dev/videoN`, or a stream URL.
    #[arg(value_name = "CAMERA_SOURCE")]
    pub camera_source: String,
    /// abs_motion, rel_motion, darknet, ssd_obj or obj_tracker.
    #[arg(value_name = "PROCESS_METHOD")]
    pub process_method: String,

    /// Capture width in pixels.
    #[arg(long = "width", value_name = "PX", default_value_t = 640)]
    pub width: u32,
    /// Capture height in pixels.
    #[arg(long = "height", value_name = "PX", default_value_t = 480)]
    pub height: u32,
    /// Smallest motion region, in pixels, that gets a rectangle.
    #[arg(long = "min-area", value_name = "PX")]
    pub min_area: Option<u32>,
    /// Motion difference threshold (0-255).
    #[arg(long = "tolerance", value_name = "LEVEL")]
    pub tolerance: Option<u8>,
    /// Detection confidence threshold (0-1).
    #[arg(long = "confidence", value_name = "SCORE")]
    pub confidence: Option<f32>,
    /// Frames a tracked object may go unmatched before it is dropped.
    #[arg(long = "max-disappeared", value_name = "FRAMES", default_value_t = 50)]
    pub max_disappeared: u32,
    /// Bound the `queue` policy's FIFO.
    #[arg(long = "queue-capacity", value_name = "FRAMES")]
    pub queue_capacity: Option<usize>,
    /// Discard the oldest queued frame instead of blocking capture when full.
    #[arg(long = "drop-oldest", action = clap::ArgAction::SetTrue)]
    pub drop_oldest: bool,
    /// Detector model path.
    #[arg(long = "model", value_name = "PATH")]
    pub model_path: Option<PathBuf>,
    /// Class label file, one name per line.
    #[arg(long = "labels", value_name = "PATH")]
    pub labels_path: Option<PathBuf>,
    /// Treat detector errors as frames without detections.
    #[arg(long = "degrade-on-detector-error", action = clap::ArgAction::SetTrue)]
    pub degrade_on_detector_error: bool,
    /// JPEG quality used by the encoder (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = 85)]
    pub jpeg_quality: u8,
    /// Keep the latest annotated frame on disk at this path.
    #[arg(long = "snapshot", value_name = "PATH")]
    pub snapshot: Option<PathBuf>,
    /// Times to rebuild the source after it becomes unavailable.
    #[arg(long = "reconnect-attempts", value_name = "N", default_value_t = 0)]
    pub reconnect_attempts: u32,
    /// Enable verbose logging.
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

impl TryFrom<VisionCliArgs> for VisionConfig {
    type Error = ConfigError;

    fn try_from(args: VisionCliArgs) -> Result<Self, Self::Error> {
        let policy = args
            .camera_mode
            .parse::<AcquisitionPolicy>()
            .map_err(|err| ConfigError::UnknownPolicy(err.0))?;
        let stage = args.process_method.parse::<StageKind>()?;
        if args.camera_source.trim().is_empty() {
            return Err(invalid("camera source must not be empty"));
        }
        let source = SourceDescriptor::parse(&args.camera_source);

        if args.width == 0 || args.height == 0 {
            return Err(invalid("capture width and height must be positive integers"));
        }

        let motion_defaults = MotionOptions::default();
        let motion = MotionOptions {
            min_area: args.min_area.unwrap_or(motion_defaults.min_area),
            tolerance: args.tolerance.unwrap_or(motion_defaults.tolerance),
        };

        let confidence = args.confidence.unwrap_or(stage.default_confidence());
        if !(0.0..=1.0).contains(&confidence) {
            return Err(invalid("--confidence must be between 0 and 1"));
        }

        let queue_bound = match (args.queue_capacity, args.drop_oldest) {
            (None, false) => QueueBound::Unbounded,
            (None, true) => return Err(invalid("--drop-oldest requires --queue-capacity")),
            (Some(0), _) => return Err(invalid("--queue-capacity must be at least 1")),
            (Some(capacity), drop_oldest) => QueueBound::Bounded {
                capacity,
                overflow: if drop_oldest {
                    OverflowPolicy::DropOldest
                } else {
                    OverflowPolicy::Block
                },
            },
        };
        if policy == AcquisitionPolicy::Newest && queue_bound != QueueBound::Unbounded {
            return Err(invalid(
                "--queue-capacity and --drop-oldest only apply to the `queue` camera mode",
            ));
        }

        if stage.needs_detector() && args.model_path.is_none() {
            return Err(invalid(format!("`{stage}` requires --model <path>")));
        }

        if !(1..=100).contains(&args.jpeg_quality) {
            return Err(invalid("--jpeg-quality must be an integer between 1 and 100"));
        }

        let detector_failure = if args.degrade_on_detector_error {
            DetectorFailurePolicy::Degrade
        } else {
            DetectorFailurePolicy::Propagate
        };

        Ok(Self {
            policy,
            source,
            stage,
            width: args.width,
            height: args.height,
            queue_bound,
            motion,
            confidence,
            max_disappeared: args.max_disappeared,
            model_path: args.model_path,
            labels_path: args.labels_path,
            detector_failure,
            jpeg_quality: args.jpeg_quality,
            snapshot_path: args.snapshot,
            reconnect_attempts: args.reconnect_attempts,
            telemetry: TelemetryOptions {
                verbose: args.verbose,
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        vision: VisionCliArgs,
    }

    fn parse(args: &[&str]) -> Result<VisionConfig, ConfigError> {
        let cli = TestCli::try_parse_from(std::iter::once("test").chain(args.iter().copied()))
            .expect("clap rejected arguments");
        VisionConfig::try_from(cli.vision)
    }

    #[test]
    fn positionals_select_policy_source_and_stage() {
        let config = parse(&["newest", "local", "abs_motion"]).unwrap();
        assert_eq!(config.policy, AcquisitionPolicy::Newest);
        assert_eq!(config.source, SourceDescriptor::LocalDevice(0));
        assert_eq!(config.stage, StageKind::AbsoluteMotion);
        assert_eq!(config.motion, MotionOptions::default());
        assert_eq!((config.width, config.height), (640, 480));
        assert_eq!(config.queue_bound, QueueBound::Unbounded);
    }

    #[test]
    fn unknown_policy_and_stage_are_rejected() {
        assert!(matches!(
            parse(&["latest", "local", "abs_motion"]),
            Err(ConfigError::UnknownPolicy(_))
        ));
        assert!(matches!(
            parse(&["queue", "local", "optical_flow"]),
            Err(ConfigError::UnknownStage(_))
        ));
    }

    #[test]
    fn detection_stages_need_a_model() {
        assert!(parse(&["queue", "local", "obj_tracker"]).is_err());
        let config = parse(&["queue", "local", "obj_tracker", "--model", "ssd.pt"]).unwrap();
        assert_eq!(config.confidence, 0.5);
        assert_eq!(config.max_disappeared, 50);
    }

    #[test]
    fn confidence_defaults_follow_stage() {
        let ssd = parse(&["queue", "local", "ssd_obj", "--model", "m.pt"]).unwrap();
        assert_eq!(ssd.confidence, 0.2);
        let darknet = parse(&["queue", "local", "darknet", "--model", "m.pt"]).unwrap();
        assert_eq!(darknet.confidence, 0.5);
        let detect = parse(&["queue", "local", "detect", "--model", "m.pt"]).unwrap();
        assert_eq!(detect.stage, StageKind::Detect);
    }

    #[test]
    fn tracker_model_input_keeps_frame_size() {
        let tracker = StageKind::ObjectTracker.preprocessing();
        assert_eq!(tracker.input_dimensions(640, 480), (640, 480));
        assert_eq!(tracker.mean, [104.0, 177.0, 123.0]);
        assert_eq!(tracker.scale, 1.0);
        for stage in [StageKind::Darknet, StageKind::Detect] {
            assert_eq!(stage.preprocessing(), Preprocessing::mobilenet_ssd());
        }
    }

    #[test]
    fn queue_bounds_are_validated() {
        let config = parse(&[
            "queue",
            "rtsp://cam/live",
            "rel_motion",
            "--queue-capacity",
            "8",
            "--drop-oldest",
        ])
        .unwrap();
        assert_eq!(
            config.queue_bound,
            QueueBound::Bounded {
                capacity: 8,
                overflow: OverflowPolicy::DropOldest
            }
        );
        assert!(parse(&["queue", "local", "rel_motion", "--drop-oldest"]).is_err());
        assert!(parse(&["queue", "local", "rel_motion", "--queue-capacity", "0"]).is_err());
        assert!(parse(&["newest", "local", "rel_motion", "--queue-capacity", "4"]).is_err());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(parse(&["queue", "local", "abs_motion", "--jpeg-quality", "0"]).is_err());
        assert!(parse(&["queue", "local", "abs_motion", "--width", "0"]).is_err());
        assert!(
            parse(&["queue", "local", "ssd_obj", "--model", "m.pt", "--confidence", "1.5"])
                .is_err()
        );
    }
}
