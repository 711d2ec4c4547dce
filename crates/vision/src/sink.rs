//! Consumers of processed frames.

use std::{
    fs,
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock},
    time::Instant,
};

use anyhow::{Context, anyhow};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use image::{RgbImage, codecs::jpeg::JpegEncoder};
use tracing::warn;
use video_ingest::Frame;

use crate::error::PipelineError;

/// Per-iteration numbers handed to the sink with each frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameStats {
    /// Frames published so far by this loop, starting at 1.
    pub frame_number: u64,
    /// Smoothed processing rate.
    pub fps: f32,
}

/// Encoded frame ready to be served.
#[derive(Clone, Debug)]
pub struct FramePacket {
    pub jpeg: Vec<u8>,
    pub frame_number: u64,
    pub timestamp_ms: i64,
    pub fps: f32,
    pub width: u32,
    pub height: u32,
}

pub trait FrameSink: Send {
    fn publish(&mut self, frame: Frame, stats: FrameStats) -> Result<(), PipelineError>;
}

impl FrameSink for Box<dyn FrameSink> {
    fn publish(&mut self, frame: Frame, stats: FrameStats) -> Result<(), PipelineError> {
        (**self).publish(frame, stats)
    }
}

/// Shared slot holding the most recent encoded frame.
///
/// One writer replaces the packet under the write lock; any number of cloned
/// handles read it. Readers get an `Arc` and never hold the lock while using
/// the bytes.
#[derive(Clone, Default)]
pub struct LatestFrame {
    slot: Arc<RwLock<Option<Arc<FramePacket>>>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, packet: FramePacket) {
        let packet = Arc::new(packet);
        let mut guard = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(packet);
    }

    pub fn latest(&self) -> Option<Arc<FramePacket>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Encode a BGR frame as JPEG at `quality` (1-100).
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, PipelineError> {
    let rgb: Vec<u8> = frame
        .data
        .chunks_exact(3)
        .flat_map(|bgr| [bgr[2], bgr[1], bgr[0]])
        .collect();
    let image = RgbImage::from_raw(frame.width, frame.height, rgb).ok_or_else(|| {
        PipelineError::InvalidFrame(format!(
            "pixel buffer does not match {}x{}",
            frame.width, frame.height
        ))
    })?;

    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(&image)
        .map_err(|err| PipelineError::Sink(anyhow!("JPEG encode failed: {err}")))?;
    Ok(buffer)
}

/// Encodes every frame into a [`LatestFrame`] and optionally mirrors it to a
/// snapshot file.
pub struct JpegSink {
    latest: LatestFrame,
    quality: u8,
    snapshot: Option<PathBuf>,
}

impl JpegSink {
    pub fn new(latest: LatestFrame, quality: u8) -> Self {
        Self {
            latest,
            quality,
            snapshot: None,
        }
    }

    /// Rewrite `path` with each encoded frame. The file is replaced by rename,
    /// so readers never see a partial image.
    pub fn with_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot = Some(path.into());
        self
    }

    pub fn latest(&self) -> LatestFrame {
        self.latest.clone()
    }

    fn write_snapshot(&self, jpeg: &[u8]) -> Result<(), PipelineError> {
        let Some(path) = self.snapshot.as_ref() else {
            return Ok(());
        };
        let tmp_path = path.with_extension("jpg.tmp");
        fs::write(&tmp_path, jpeg)
            .and_then(|()| fs::rename(&tmp_path, path))
            .with_context(|| format!("failed to write snapshot {}", path.display()))
            .map_err(PipelineError::Sink)
    }
}

impl FrameSink for JpegSink {
    fn publish(&mut self, frame: Frame, stats: FrameStats) -> Result<(), PipelineError> {
        let encode_start = Instant::now();
        let jpeg = encode_jpeg(&frame, self.quality)?;
        metrics::histogram!("vision_stage_latency_seconds", "stage" => "encoding")
            .record(encode_start.elapsed().as_secs_f64());

        self.write_snapshot(&jpeg)?;
        self.latest.store(FramePacket {
            jpeg,
            frame_number: stats.frame_number,
            timestamp_ms: frame.timestamp_ms,
            fps: stats.fps,
            width: frame.width,
            height: frame.height,
        });
        Ok(())
    }
}

/// Forwards processed frames over a channel.
///
/// A bounded channel drops frames while the receiver is behind; a closed
/// channel is an error.
pub struct ChannelSink {
    tx: Sender<(Frame, FrameStats)>,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, Receiver<(Frame, FrameStats)>) {
        let (tx, rx) = bounded(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn unbounded() -> (Self, Receiver<(Frame, FrameStats)>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl FrameSink for ChannelSink {
    fn publish(&mut self, frame: Frame, stats: FrameStats) -> Result<(), PipelineError> {
        match self.tx.try_send((frame, stats)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Dropping processed frame {}: sink queue full", stats.frame_number);
                metrics::counter!("vision_sink_dropped_frames_total").increment(1);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(PipelineError::Sink(anyhow!("frame channel closed")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(frame_number: u64) -> FrameStats {
        FrameStats {
            frame_number,
            fps: 12.5,
        }
    }

    #[test]
    fn latest_frame_keeps_only_the_newest_packet() {
        let latest = LatestFrame::new();
        assert!(latest.latest().is_none());

        let reader = latest.clone();
        let mut sink = JpegSink::new(latest, 80);
        sink.publish(Frame::filled(16, 8, [0, 0, 255]), stats(1)).unwrap();
        sink.publish(Frame::filled(16, 8, [255, 0, 0]), stats(2)).unwrap();

        let packet = reader.latest().unwrap();
        assert_eq!(packet.frame_number, 2);
        assert_eq!((packet.width, packet.height), (16, 8));
        assert_eq!(packet.fps, 12.5);
    }

    #[test]
    fn encoded_frames_are_decodable_rgb() {
        let jpeg = encode_jpeg(&Frame::filled(32, 16, [0, 0, 255]), 95).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&jpeg).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (32, 16));
        let pixel = decoded.get_pixel(16, 8);
        assert!(pixel[0] > 200 && pixel[2] < 60, "expected red, got {pixel:?}");
    }

    #[test]
    fn snapshot_file_is_replaced_each_frame() {
        let path = std::env::temp_dir().join(format!("vision-snapshot-{}.jpg", std::process::id()));
        let mut sink = JpegSink::new(LatestFrame::new(), 85).with_snapshot(&path);
        sink.publish(Frame::filled(8, 8, [0, 0, 0]), stats(1)).unwrap();
        sink.publish(Frame::filled(8, 8, [200, 200, 200]), stats(2)).unwrap();

        let written = fs::read(&path).unwrap();
        fs::remove_file(&path).ok();
        assert_eq!(written, sink.latest().latest().unwrap().jpeg);
        assert!(!path.with_extension("jpg.tmp").exists());
    }

    #[test]
    fn channel_sink_drops_when_full_and_fails_when_closed() {
        let (mut sink, rx) = ChannelSink::bounded(1);
        sink.publish(Frame::filled(2, 2, [1, 1, 1]), stats(1)).unwrap();
        sink.publish(Frame::filled(2, 2, [2, 2, 2]), stats(2)).unwrap();
        let (frame, received) = rx.recv().unwrap();
        assert_eq!(received.frame_number, 1);
        assert_eq!(frame.data[0], 1);
        assert!(rx.try_recv().is_err());

        drop(rx);
        let err = sink.publish(Frame::filled(2, 2, [3, 3, 3]), stats(3)).unwrap_err();
        assert!(matches!(err, PipelineError::Sink(_)));
    }
}
