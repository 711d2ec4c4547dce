//! Video acquisition: frame sources and the providers that hand frames to the
//! processing loop.

#[cfg(feature = "opencv")]
mod camera;
mod ffmpeg;
mod provider;
mod source;
mod types;
mod worker;

#[cfg(feature = "opencv")]
pub use camera::OpenCvSource;
pub use ffmpeg::FfmpegSource;
pub use provider::{
    AcquisitionPolicy, FrameProvider, NewestFrameProvider, OverflowPolicy, QueueBound,
    QueuedFrameProvider, UnknownPolicy, start_provider,
};
pub use source::{FrameSource, SourceDescriptor};
pub use types::{CaptureError, Frame, FrameFormat};
pub use worker::spawn_thread;
