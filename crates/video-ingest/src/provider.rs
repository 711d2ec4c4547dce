//! Frame providers: how frames travel from a [`FrameSource`] to the
//! processing loop.
//!
//! Both providers run the same background acquisition loop and differ only in
//! the buffer it writes into:
//! - [`QueuedFrameProvider`] appends every frame to a FIFO so nothing is
//!   skipped, at the cost of growing latency when the consumer is slow.
//! - [`NewestFrameProvider`] keeps a single slot that is overwritten by every
//!   capture, so the consumer always sees the freshest frame and may skip some.

use std::{
    fmt,
    str::FromStr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
};

use anyhow::anyhow;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    source::FrameSource,
    types::{CaptureError, Frame},
    worker::spawn_thread,
};

/// Backpressure/staleness policy used to hand frames to the consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquisitionPolicy {
    /// Every frame, in capture order.
    Queued,
    /// Only the most recent frame.
    Newest,
}

#[derive(Debug, Error)]
#[error("unknown acquisition policy {0:?} (expected `queue` or `newest`)")]
pub struct UnknownPolicy(pub String);

impl FromStr for AcquisitionPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" | "queued" => Ok(AcquisitionPolicy::Queued),
            "newest" => Ok(AcquisitionPolicy::Newest),
            _ => Err(UnknownPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for AcquisitionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionPolicy::Queued => f.write_str("queue"),
            AcquisitionPolicy::Newest => f.write_str("newest"),
        }
    }
}

/// What a bounded queue does when the producer finds it full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// The capture loop waits for the consumer. No frame is lost.
    Block,
    /// The oldest queued frame is discarded to make room.
    DropOldest,
}

/// Capacity of the queued provider's FIFO.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum QueueBound {
    #[default]
    Unbounded,
    Bounded {
        capacity: usize,
        overflow: OverflowPolicy,
    },
}

/// Source of successive frames for the processing loop.
pub trait FrameProvider: Send {
    /// Next frame according to the provider's policy.
    ///
    /// Fails with [`CaptureError::SourceUnavailable`] once the source can no
    /// longer produce frames. The provider never retries on its own.
    fn next_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Number of frames the acquisition loop has written so far.
    fn captured_frames(&self) -> u64;

    fn policy(&self) -> AcquisitionPolicy;
}

impl FrameProvider for Box<dyn FrameProvider> {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        (**self).next_frame()
    }

    fn captured_frames(&self) -> u64 {
        (**self).captured_frames()
    }

    fn policy(&self) -> AcquisitionPolicy {
        (**self).policy()
    }
}

/// Start the provider matching `policy` over `source`.
///
/// `bound` only applies to [`AcquisitionPolicy::Queued`].
pub fn start_provider<S: FrameSource>(
    policy: AcquisitionPolicy,
    source: S,
    bound: QueueBound,
) -> Result<Box<dyn FrameProvider>, CaptureError> {
    Ok(match policy {
        AcquisitionPolicy::Queued => Box::new(QueuedFrameProvider::start(source, bound)?),
        AcquisitionPolicy::Newest => Box::new(NewestFrameProvider::start(source)?),
    })
}

/// Buffering discipline plugged into the shared acquisition loop.
trait FrameBuffer: Send + 'static {
    /// Store a captured frame. Returns `false` once nobody will read it.
    fn store(&self, frame: Frame) -> bool;

    /// Record the error that ended acquisition.
    fn fail(&self, err: CaptureError);
}

struct AcquisitionState {
    stop: AtomicBool,
    captured: AtomicU64,
}

impl AcquisitionState {
    fn new(already_captured: u64) -> Arc<Self> {
        Arc::new(Self {
            stop: AtomicBool::new(false),
            captured: AtomicU64::new(already_captured),
        })
    }
}

fn spawn_acquisition<S, B>(
    source: S,
    buffer: B,
    state: Arc<AcquisitionState>,
    first_sequence: u64,
) -> Result<thread::JoinHandle<()>, CaptureError>
where
    S: FrameSource,
    B: FrameBuffer,
{
    spawn_thread("frame-acquisition", move || {
        acquisition_loop(source, buffer, &state, first_sequence)
    })
    .map_err(|err| CaptureError::Other(err.into()))
}

/// Capture until stopped, the source fails, or the buffer loses its reader.
fn acquisition_loop<S, B>(mut source: S, buffer: B, state: &AcquisitionState, mut sequence: u64)
where
    S: FrameSource,
    B: FrameBuffer,
{
    let origin = source.describe();
    while !state.stop.load(Ordering::Relaxed) {
        match source.capture() {
            Ok(mut frame) => {
                frame.sequence = sequence;
                sequence = sequence.wrapping_add(1);
                if !buffer.store(frame) {
                    debug!("frame consumer for {origin} went away; stopping acquisition");
                    break;
                }
                state.captured.fetch_add(1, Ordering::Release);
                metrics::counter!("vision_frames_captured_total").increment(1);
            }
            Err(err) => {
                warn!("capture from {origin} failed: {err}");
                buffer.fail(err);
                break;
            }
        }
    }
}

struct QueueBuffer {
    tx: Sender<Result<Frame, CaptureError>>,
    /// Held only in drop-oldest mode so the producer can evict.
    evict_rx: Option<Receiver<Result<Frame, CaptureError>>>,
    dropped: Arc<AtomicU64>,
}

impl QueueBuffer {
    fn push(&self, item: Result<Frame, CaptureError>) -> bool {
        let Some(evict_rx) = &self.evict_rx else {
            return self.tx.send(item).is_ok();
        };

        let mut item = item;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return true,
                Err(TrySendError::Full(back)) => {
                    if evict_rx.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("vision_capture_dropped_frames_total").increment(1);
                    }
                    item = back;
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }
}

impl FrameBuffer for QueueBuffer {
    fn store(&self, frame: Frame) -> bool {
        self.push(Ok(frame))
    }

    fn fail(&self, err: CaptureError) {
        self.push(Err(err));
    }
}

/// FIFO provider: no frame is skipped or reordered.
///
/// With [`QueueBound::Unbounded`] the backlog grows without limit when the
/// consumer is slower than the source. A bounded queue either blocks the
/// capture loop or discards the oldest frame, as chosen at construction.
/// `next_frame` blocks while the queue is empty.
pub struct QueuedFrameProvider {
    rx: Receiver<Result<Frame, CaptureError>>,
    origin: String,
    state: Arc<AcquisitionState>,
    dropped: Arc<AtomicU64>,
    handle: Option<thread::JoinHandle<()>>,
}

impl QueuedFrameProvider {
    pub fn start<S: FrameSource>(source: S, bound: QueueBound) -> Result<Self, CaptureError> {
        let origin = source.describe();
        let (tx, rx, evict_rx) = match bound {
            QueueBound::Unbounded => {
                let (tx, rx) = unbounded();
                (tx, rx, None)
            }
            QueueBound::Bounded { capacity, overflow } => {
                let (tx, rx) = bounded(capacity.max(1));
                let evict_rx = match overflow {
                    OverflowPolicy::Block => None,
                    OverflowPolicy::DropOldest => Some(rx.clone()),
                };
                (tx, rx, evict_rx)
            }
        };

        let dropped = Arc::new(AtomicU64::new(0));
        let state = AcquisitionState::new(0);
        let buffer = QueueBuffer {
            tx,
            evict_rx,
            dropped: dropped.clone(),
        };
        let handle = spawn_acquisition(source, buffer, state.clone(), 0)?;
        debug!("queued frame provider started for {origin} ({bound:?})");

        Ok(Self {
            rx,
            origin,
            state,
            dropped,
            handle: Some(handle),
        })
    }

    /// Frames discarded by a drop-oldest queue.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Frames captured but not yet consumed.
    pub fn backlog(&self) -> usize {
        self.rx.len()
    }

    /// Stop acquisition and wait for the capture thread to finish.
    ///
    /// Blocks for as long as the source blocks inside `capture`.
    pub fn stop(mut self) {
        let handle = self.handle.take();
        drop(self);
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl FrameProvider for QueuedFrameProvider {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        match self.rx.recv() {
            Ok(item) => item,
            Err(_) => Err(CaptureError::unavailable(
                &self.origin,
                "acquisition stopped",
            )),
        }
    }

    fn captured_frames(&self) -> u64 {
        self.state.captured.load(Ordering::Acquire)
    }

    fn policy(&self) -> AcquisitionPolicy {
        AcquisitionPolicy::Queued
    }
}

impl Drop for QueuedFrameProvider {
    fn drop(&mut self) {
        self.state.stop.store(true, Ordering::SeqCst);
    }
}

struct SlotState {
    frame: Arc<Frame>,
    failure: Option<String>,
}

/// Single-slot buffer shared between the capture thread and the reader.
///
/// The lock only guards swapping or cloning the `Arc`, never a pixel copy.
struct NewestSlot {
    latest: Mutex<SlotState>,
}

impl FrameBuffer for Arc<NewestSlot> {
    fn store(&self, frame: Frame) -> bool {
        let frame = Arc::new(frame);
        let mut guard = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        guard.frame = frame;
        drop(guard);
        Arc::strong_count(self) > 1
    }

    fn fail(&self, err: CaptureError) {
        let mut guard = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        guard.failure = Some(err.to_string());
    }
}

/// Newest-only provider: `next_frame` returns the most recent capture and
/// never blocks.
///
/// The first frame is captured during [`NewestFrameProvider::start`], so the
/// slot is never empty. Consecutive calls may return the same frame again or
/// skip frames, but sequence numbers never go backwards.
pub struct NewestFrameProvider {
    slot: Arc<NewestSlot>,
    origin: String,
    state: Arc<AcquisitionState>,
    handle: Option<thread::JoinHandle<()>>,
}

impl NewestFrameProvider {
    pub fn start<S: FrameSource>(mut source: S) -> Result<Self, CaptureError> {
        let origin = source.describe();
        let mut first = source.capture()?;
        first.sequence = 0;

        let slot = Arc::new(NewestSlot {
            latest: Mutex::new(SlotState {
                frame: Arc::new(first),
                failure: None,
            }),
        });
        let state = AcquisitionState::new(1);
        let handle = spawn_acquisition(source, slot.clone(), state.clone(), 1)?;
        debug!("newest frame provider started for {origin}");

        Ok(Self {
            slot,
            origin,
            state,
            handle: Some(handle),
        })
    }

    /// Stop acquisition and wait for the capture thread to finish.
    ///
    /// Blocks for as long as the source blocks inside `capture`.
    pub fn stop(mut self) {
        let handle = self.handle.take();
        drop(self);
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl FrameProvider for NewestFrameProvider {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        let (frame, failure) = {
            let guard = self
                .slot
                .latest
                .lock()
                .map_err(|_| CaptureError::Other(anyhow!("frame slot poisoned")))?;
            (guard.frame.clone(), guard.failure.clone())
        };
        if let Some(reason) = failure {
            return Err(CaptureError::unavailable(&self.origin, reason));
        }
        Ok(Frame::clone(&frame))
    }

    fn captured_frames(&self) -> u64 {
        self.state.captured.load(Ordering::Acquire)
    }

    fn policy(&self) -> AcquisitionPolicy {
        AcquisitionPolicy::Newest
    }
}

impl Drop for NewestFrameProvider {
    fn drop(&mut self) {
        self.state.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    /// Source fed by the test; ends once the sender is dropped.
    struct ScriptedSource {
        frames: Receiver<Frame>,
    }

    impl FrameSource for ScriptedSource {
        fn capture(&mut self) -> Result<Frame, CaptureError> {
            self.frames
                .recv()
                .map_err(|_| CaptureError::unavailable("scripted", "script finished"))
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    fn scripted() -> (Sender<Frame>, ScriptedSource) {
        let (tx, rx) = unbounded();
        (tx, ScriptedSource { frames: rx })
    }

    fn tagged(tag: u8) -> Frame {
        Frame::filled(4, 2, [tag, 0, 0])
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn policy_names_parse() {
        assert_eq!("queue".parse::<AcquisitionPolicy>().unwrap(), AcquisitionPolicy::Queued);
        assert_eq!("Newest".parse::<AcquisitionPolicy>().unwrap(), AcquisitionPolicy::Newest);
        assert!("latest".parse::<AcquisitionPolicy>().is_err());
    }

    #[test]
    fn queued_returns_every_frame_in_capture_order() {
        let (tx, source) = scripted();
        for tag in 0..50u8 {
            tx.send(tagged(tag)).unwrap();
        }
        drop(tx);

        let mut provider = QueuedFrameProvider::start(source, QueueBound::Unbounded).unwrap();
        for expected in 0..50u64 {
            let frame = provider.next_frame().unwrap();
            assert_eq!(frame.sequence, expected);
            assert_eq!(frame.data[0], expected as u8);
        }

        let err = provider.next_frame().unwrap_err();
        assert!(matches!(err, CaptureError::SourceUnavailable { .. }));
        let err = provider.next_frame().unwrap_err();
        assert!(matches!(err, CaptureError::SourceUnavailable { .. }));
    }

    #[test]
    fn bounded_blocking_queue_keeps_every_frame() {
        let (tx, source) = scripted();
        for tag in 0..20u8 {
            tx.send(tagged(tag)).unwrap();
        }
        drop(tx);

        let bound = QueueBound::Bounded {
            capacity: 2,
            overflow: OverflowPolicy::Block,
        };
        let mut provider = QueuedFrameProvider::start(source, bound).unwrap();
        for expected in 0..20u64 {
            thread::sleep(Duration::from_millis(1));
            assert!(provider.backlog() <= 2);
            assert_eq!(provider.next_frame().unwrap().sequence, expected);
        }
        assert_eq!(provider.dropped_frames(), 0);
    }

    #[test]
    fn drop_oldest_queue_keeps_the_most_recent_frames() {
        let (tx, source) = scripted();
        for tag in 0..10u8 {
            tx.send(tagged(tag)).unwrap();
        }

        let bound = QueueBound::Bounded {
            capacity: 2,
            overflow: OverflowPolicy::DropOldest,
        };
        let mut provider = QueuedFrameProvider::start(source, bound).unwrap();
        wait_until("ten captures", || provider.captured_frames() == 10);

        assert_eq!(provider.dropped_frames(), 8);
        assert_eq!(provider.next_frame().unwrap().sequence, 8);
        assert_eq!(provider.next_frame().unwrap().sequence, 9);
        drop(tx);
        provider.stop();
    }

    #[test]
    fn newest_returns_latest_capture() {
        let (tx, source) = scripted();
        tx.send(tagged(0)).unwrap();
        let mut provider = NewestFrameProvider::start(source).unwrap();
        assert_eq!(provider.next_frame().unwrap().sequence, 0);

        for tag in 1..=5u8 {
            tx.send(tagged(tag)).unwrap();
        }
        wait_until("six captures", || provider.captured_frames() == 6);

        let frame = provider.next_frame().unwrap();
        assert_eq!(frame.sequence, 5);
        assert_eq!(frame.data[0], 5);
        // The source is stalled: the same frame is handed out again, never an older one.
        assert_eq!(provider.next_frame().unwrap().sequence, 5);
        drop(tx);
    }

    #[test]
    fn newest_sequence_never_goes_backwards() {
        let (tx, source) = scripted();
        tx.send(tagged(0)).unwrap();
        let mut provider = NewestFrameProvider::start(source).unwrap();

        let producer = thread::spawn(move || {
            for tag in 1..=200u32 {
                if tx.send(tagged(tag as u8)).is_err() {
                    break;
                }
            }
        });

        let mut last = 0;
        while provider.captured_frames() < 201 {
            let sequence = provider.next_frame().unwrap().sequence;
            assert!(sequence >= last, "sequence went from {last} to {sequence}");
            last = sequence;
        }
        producer.join().unwrap();
    }

    #[test]
    fn newest_reports_source_failure() {
        let (tx, source) = scripted();
        tx.send(tagged(0)).unwrap();
        let mut provider = NewestFrameProvider::start(source).unwrap();
        drop(tx);

        wait_until("failure to surface", || {
            provider.slot.latest.lock().unwrap().failure.is_some()
        });
        let err = provider.next_frame().unwrap_err();
        assert!(matches!(err, CaptureError::SourceUnavailable { .. }));
    }

    #[test]
    fn newest_start_fails_without_a_first_frame() {
        let (tx, source) = scripted();
        drop(tx);
        let err = NewestFrameProvider::start(source).err().unwrap();
        assert!(matches!(err, CaptureError::SourceUnavailable { .. }));
    }

    #[test]
    fn start_provider_selects_policy() {
        let (tx, source) = scripted();
        tx.send(tagged(0)).unwrap();
        let provider =
            start_provider(AcquisitionPolicy::Newest, source, QueueBound::Unbounded).unwrap();
        assert_eq!(provider.policy(), AcquisitionPolicy::Newest);
        drop(tx);
    }
}
