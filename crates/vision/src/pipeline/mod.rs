//! The processing loop: provider → stage → sink, one frame per iteration.

pub mod config;
pub mod telemetry;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use tracing::{debug, info};
use video_ingest::FrameProvider;

use crate::{
    error::PipelineError,
    processing::FrameProcessor,
    sink::{FrameSink, FrameStats},
};

/// Counters kept across iterations of one [`Pipeline`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineStats {
    pub frames_processed: u64,
    /// Smoothed frames per second.
    pub fps: f32,
    /// Capture sequence of the last processed frame.
    pub last_sequence: Option<u64>,
}

/// Drives one provider, one stage and one sink.
///
/// The shutdown flag is checked between iterations only; a started iteration
/// always runs to completion.
pub struct Pipeline<P, F, S> {
    provider: P,
    processor: F,
    sink: S,
    shutdown: Arc<AtomicBool>,
    stats: PipelineStats,
    last_instant: Option<Instant>,
}

impl<P, F, S> Pipeline<P, F, S>
where
    P: FrameProvider,
    F: FrameProcessor,
    S: FrameSink,
{
    pub fn new(provider: P, processor: F, sink: S, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            provider,
            processor,
            sink,
            shutdown,
            stats: PipelineStats::default(),
            last_instant: None,
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn into_parts(self) -> (P, F, S) {
        (self.provider, self.processor, self.sink)
    }

    /// Loop until shutdown is requested or an iteration fails.
    ///
    /// On error, [`Pipeline::stats`] still reports the frames completed
    /// before the failure.
    pub fn run(&mut self) -> Result<PipelineStats, PipelineError> {
        let pipeline_span = tracing::info_span!(
            "vision.pipeline",
            stage = self.processor.name(),
            policy = %self.provider.policy()
        );
        let _pipeline_guard = pipeline_span.enter();
        info!(
            "Running {} pipeline ({} acquisition)",
            self.processor.name(),
            self.provider.policy()
        );

        while !self.shutdown.load(Ordering::Relaxed) {
            self.step()?;
        }

        info!(
            "Stopping vision pipeline after {} frame(s)",
            self.stats.frames_processed
        );
        Ok(self.stats.clone())
    }

    /// Run exactly one iteration.
    pub fn step(&mut self) -> Result<(), PipelineError> {
        let frame = tracing::info_span!("capture.recv").in_scope(|| self.provider.next_frame())?;
        let dimensions = frame.dimensions();
        let sequence = frame.sequence;
        let timestamp_ms = frame.timestamp_ms;

        let frame_span = tracing::info_span!(
            "frame",
            sequence,
            width = dimensions.0,
            height = dimensions.1,
            timestamp = timestamp_ms
        );
        let _frame_guard = frame_span.enter();

        let stage = self.processor.name();
        let stage_start = Instant::now();
        let processed = tracing::info_span!("processing.stage", stage)
            .in_scope(|| self.processor.process(frame))?;
        metrics::histogram!("vision_stage_latency_seconds", "stage" => stage)
            .record(stage_start.elapsed().as_secs_f64());

        if processed.dimensions() != dimensions {
            return Err(PipelineError::InvalidFrame(format!(
                "{stage} returned {}x{} for a {}x{} frame",
                processed.width, processed.height, dimensions.0, dimensions.1
            )));
        }

        self.update_fps();
        self.stats.frames_processed += 1;
        self.stats.last_sequence = Some(sequence);
        let frame_number = self.stats.frames_processed;
        metrics::counter!("vision_frames_processed_total").increment(1);

        if frame_number % 30 == 0 {
            debug!(
                "Pipeline heartbeat: frame #{}, {:.1} fps, seq={}, ts={}",
                frame_number, self.stats.fps, sequence, timestamp_ms
            );
        }

        let stats = FrameStats {
            frame_number,
            fps: self.stats.fps,
        };
        tracing::info_span!("sink.publish").in_scope(|| self.sink.publish(processed, stats))
    }

    fn update_fps(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_instant.replace(now) {
            let elapsed = now.duration_since(last).as_secs_f32();
            if elapsed > 0.0 {
                let instant = 1.0 / elapsed;
                self.stats.fps = if self.stats.fps == 0.0 {
                    instant
                } else {
                    0.9 * self.stats.fps + 0.1 * instant
                };
            }
        }
        metrics::gauge!("vision_pipeline_fps").set(self.stats.fps as f64);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use video_ingest::{AcquisitionPolicy, CaptureError, Frame};

    use super::*;

    struct ListProvider {
        frames: VecDeque<Frame>,
        shutdown_when_empty: Option<Arc<AtomicBool>>,
    }

    impl FrameProvider for ListProvider {
        fn next_frame(&mut self) -> Result<Frame, CaptureError> {
            let frame = self
                .frames
                .pop_front()
                .ok_or_else(|| CaptureError::unavailable("list", "no more frames"))?;
            if self.frames.is_empty() {
                if let Some(flag) = &self.shutdown_when_empty {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            Ok(frame)
        }

        fn captured_frames(&self) -> u64 {
            0
        }

        fn policy(&self) -> AcquisitionPolicy {
            AcquisitionPolicy::Queued
        }
    }

    struct Passthrough;

    impl FrameProcessor for Passthrough {
        fn name(&self) -> &'static str {
            "passthrough"
        }

        fn process(&mut self, frame: Frame) -> Result<Frame, PipelineError> {
            Ok(frame)
        }
    }

    struct Shrink;

    impl FrameProcessor for Shrink {
        fn name(&self) -> &'static str {
            "shrink"
        }

        fn process(&mut self, _frame: Frame) -> Result<Frame, PipelineError> {
            Ok(Frame::filled(1, 1, [0, 0, 0]))
        }
    }

    #[derive(Default)]
    struct Collect(Vec<(u64, FrameStats)>);

    impl FrameSink for Collect {
        fn publish(&mut self, frame: Frame, stats: FrameStats) -> Result<(), PipelineError> {
            self.0.push((frame.sequence, stats));
            Ok(())
        }
    }

    fn frames(count: u64) -> VecDeque<Frame> {
        (0..count)
            .map(|sequence| {
                let mut frame = Frame::filled(4, 4, [0, 0, 0]);
                frame.sequence = sequence;
                frame
            })
            .collect()
    }

    #[test]
    fn run_stops_when_shutdown_is_observed() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let provider = ListProvider {
            frames: frames(5),
            shutdown_when_empty: Some(shutdown.clone()),
        };
        let mut pipeline = Pipeline::new(provider, Passthrough, Collect::default(), shutdown);
        let stats = pipeline.run().unwrap();
        assert_eq!(stats.frames_processed, 5);
        assert_eq!(stats.last_sequence, Some(4));

        let (_, _, sink) = pipeline.into_parts();
        let published: Vec<u64> = sink.0.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(published, vec![0, 1, 2, 3, 4]);
        let numbers: Vec<u64> = sink.0.iter().map(|(_, s)| s.frame_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn source_failure_ends_the_loop_with_stats_intact() {
        let provider = ListProvider {
            frames: frames(3),
            shutdown_when_empty: None,
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut pipeline = Pipeline::new(provider, Passthrough, Collect::default(), shutdown);
        let err = pipeline.run().unwrap_err();
        assert!(err.is_source_unavailable());
        assert_eq!(pipeline.stats().frames_processed, 3);
    }

    #[test]
    fn preset_shutdown_processes_nothing() {
        let provider = ListProvider {
            frames: frames(3),
            shutdown_when_empty: None,
        };
        let shutdown = Arc::new(AtomicBool::new(true));
        let mut pipeline = Pipeline::new(provider, Passthrough, Collect::default(), shutdown);
        assert_eq!(pipeline.run().unwrap().frames_processed, 0);
    }

    #[test]
    fn stages_must_preserve_dimensions() {
        let provider = ListProvider {
            frames: frames(1),
            shutdown_when_empty: None,
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut pipeline = Pipeline::new(provider, Shrink, Collect::default(), shutdown);
        assert!(matches!(pipeline.step(), Err(PipelineError::InvalidFrame(_))));
        assert_eq!(pipeline.stats().frames_processed, 0);
    }
}
