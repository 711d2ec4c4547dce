//! Pipeline supervisor: wires source, provider, stage and sink from a
//! `VisionConfig`, and rebuilds them when the source drops out.

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use ml_core::Detector;
use tracing::{info, warn};
use video_ingest::{FrameProvider, FrameSource, start_provider};
use vision::{
    FrameProcessor, JpegSink, LatestFrame, Pipeline, PipelineError, PipelineStats, VisionConfig,
    build_processor,
};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

type MonitorPipeline = Pipeline<Box<dyn FrameProvider>, Box<dyn FrameProcessor>, JpegSink>;

/// Result of a single pipeline run attempt.
enum PipelineOutcome {
    Graceful(PipelineStats),
    Restart {
        error: PipelineError,
        frames_processed: u64,
    },
}

/// Run the pipeline until Ctrl+C, reconnecting when the source becomes
/// unavailable. Up to `config.reconnect_attempts` reconnects are made in a
/// row; a run that processed frames starts the count again.
pub fn run(config: VisionConfig) -> Result<()> {
    let shutdown = install_shutdown_handler();
    let latest = LatestFrame::new();

    let mut attempt: u32 = 0;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        match run_pipeline_once(&config, shutdown.clone(), latest.clone()) {
            Ok(PipelineOutcome::Graceful(stats)) => {
                info!(
                    "Vision monitor stopped after {} frame(s) ({:.1} fps)",
                    stats.frames_processed, stats.fps
                );
                break;
            }
            Ok(PipelineOutcome::Restart {
                error,
                frames_processed,
            }) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let Some(next) =
                    reconnect_attempt(attempt, frames_processed, config.reconnect_attempts)
                else {
                    return Err(error).with_context(|| {
                        format!(
                            "{} is unavailable after {attempt} reconnect attempt(s)",
                            config.source
                        )
                    });
                };
                attempt = next;
                warn!(
                    "Source {} unavailable ({error}), reconnect attempt #{attempt} of {}",
                    config.source, config.reconnect_attempts
                );
                thread::sleep(RECONNECT_DELAY);
            }
            Err(err) => return Err(err).context("vision pipeline failed"),
        }
    }

    if let Some(packet) = latest.latest() {
        info!(
            "Last published frame #{} ({}x{}, {} bytes)",
            packet.frame_number,
            packet.width,
            packet.height,
            packet.jpeg.len()
        );
    }
    Ok(())
}

fn install_shutdown_handler() -> Arc<AtomicBool> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
    shutdown
}

/// Number of the next reconnect attempt, or `None` once `limit` consecutive
/// attempts have failed. Frames processed since the last attempt mean the
/// source recovered, so counting restarts from one.
fn reconnect_attempt(previous: u32, frames_processed: u64, limit: u32) -> Option<u32> {
    let previous = if frames_processed > 0 { 0 } else { previous };
    (previous < limit).then_some(previous + 1)
}

/// Execute the pipeline once.
///
/// Source failures, at startup or mid-run, come back as a restart request;
/// every other error is returned as is.
fn run_pipeline_once(
    config: &VisionConfig,
    shutdown: Arc<AtomicBool>,
    latest: LatestFrame,
) -> Result<PipelineOutcome, PipelineError> {
    let mut pipeline = match build_pipeline(config, shutdown, latest) {
        Ok(pipeline) => pipeline,
        Err(error) if error.is_source_unavailable() => {
            return Ok(PipelineOutcome::Restart {
                error,
                frames_processed: 0,
            });
        }
        Err(err) => return Err(err),
    };

    match pipeline.run() {
        Ok(stats) => Ok(PipelineOutcome::Graceful(stats)),
        Err(error) if error.is_source_unavailable() => Ok(PipelineOutcome::Restart {
            error,
            frames_processed: pipeline.stats().frames_processed,
        }),
        Err(err) => Err(err),
    }
}

fn build_pipeline(
    config: &VisionConfig,
    shutdown: Arc<AtomicBool>,
    latest: LatestFrame,
) -> Result<MonitorPipeline, PipelineError> {
    info!(
        "Opening {} at {}x{} ({} acquisition, {} stage)",
        config.source, config.width, config.height, config.policy, config.stage
    );
    let source = open_source(config)?;
    let mut provider = start_provider(config.policy, source, config.queue_bound)?;

    let detector = load_detector(config)?;
    let processor = build_processor(config, detector, &mut *provider)?;

    let mut sink = JpegSink::new(latest, config.jpeg_quality);
    if let Some(path) = &config.snapshot_path {
        sink = sink.with_snapshot(path);
    }

    Ok(Pipeline::new(provider, processor, sink, shutdown))
}

#[cfg(feature = "opencv")]
fn open_source(config: &VisionConfig) -> Result<Box<dyn FrameSource>, PipelineError> {
    let size = (config.width, config.height);
    let source = video_ingest::OpenCvSource::open(&config.source, size)?;
    Ok(Box::new(source))
}

#[cfg(not(feature = "opencv"))]
fn open_source(config: &VisionConfig) -> Result<Box<dyn FrameSource>, PipelineError> {
    let size = (config.width, config.height);
    let source = video_ingest::FfmpegSource::open(&config.source, size)?;
    Ok(Box::new(source))
}

#[cfg(feature = "with-tch")]
fn load_detector(config: &VisionConfig) -> Result<Option<Box<dyn Detector>>, PipelineError> {
    if !config.stage.needs_detector() {
        return Ok(None);
    }
    let Some(model_path) = &config.model_path else {
        return Ok(None);
    };
    let labels = config.labels_path.as_ref().map(ml_core::load_labels).transpose()?;
    let detector = ml_core::TorchDetector::load(model_path, labels)?
        .with_preprocessing(config.stage.preprocessing());
    info!("Loaded detector model {}", model_path.display());
    Ok(Some(Box::new(detector)))
}

#[cfg(not(feature = "with-tch"))]
fn load_detector(config: &VisionConfig) -> Result<Option<Box<dyn Detector>>, PipelineError> {
    if config.stage.needs_detector() {
        warn!(
            "`{}` needs a detector but vision-monitor was built without the `with-tch` feature",
            config.stage
        );
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use video_ingest::{AcquisitionPolicy, CaptureError, SourceDescriptor};
    use vision::{ConfigError, StageKind};

    use super::*;

    fn config(stage: StageKind) -> VisionConfig {
        VisionConfig::new(AcquisitionPolicy::Queued, SourceDescriptor::LocalDevice(0), stage)
    }

    #[test]
    fn motion_stages_load_no_detector() {
        assert!(load_detector(&config(StageKind::RelativeMotion)).unwrap().is_none());
    }

    #[test]
    fn reconnects_stop_at_the_limit() {
        assert_eq!(reconnect_attempt(0, 0, 0), None);
        assert_eq!(reconnect_attempt(0, 0, 2), Some(1));
        assert_eq!(reconnect_attempt(1, 0, 2), Some(2));
        assert_eq!(reconnect_attempt(2, 0, 2), None);
    }

    #[test]
    fn a_productive_run_resets_the_reconnect_count() {
        assert_eq!(reconnect_attempt(2, 10, 2), Some(1));
        assert_eq!(reconnect_attempt(5, 1, 1), Some(1));
        assert_eq!(reconnect_attempt(3, 1, 0), None);
    }

    #[test]
    fn only_source_failures_request_a_restart() {
        let unavailable = PipelineError::from(CaptureError::unavailable("cam", "gone"));
        assert!(unavailable.is_source_unavailable());

        let invalid = PipelineError::from(ConfigError::Invalid("bad".into()));
        assert!(!invalid.is_source_unavailable());
    }
}
