//! Frame source capability and source descriptors.

use std::fmt;

use crate::types::{CaptureError, Frame};

/// A live capture device that can hand over its latest raw frame.
///
/// Implementations block until a frame is available and report
/// [`CaptureError::SourceUnavailable`] once the device or stream is gone.
/// Retrying is left to the caller.
pub trait FrameSource: Send + 'static {
    fn capture(&mut self) -> Result<Frame, CaptureError>;

    /// Human readable origin, used in logs and errors.
    fn describe(&self) -> String;
}

impl FrameSource for Box<dyn FrameSource> {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        (**self).capture()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Where frames come from: a local camera or a remote stream/file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceDescriptor {
    LocalDevice(u32),
    Remote(String),
}

impl SourceDescriptor {
    /// `local` selects device 0; bare indices and `/dev/videoN` select that
    /// device; anything else is treated as a URL or path.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("local") {
            return SourceDescriptor::LocalDevice(0);
        }
        match parse_device_index(trimmed) {
            Some(index) => SourceDescriptor::LocalDevice(index),
            None => SourceDescriptor::Remote(trimmed.to_string()),
        }
    }

    pub fn is_rtsp(&self) -> bool {
        match self {
            SourceDescriptor::Remote(uri) => {
                uri.starts_with("rtsp://") || uri.starts_with("rtsps://")
            }
            _ => false,
        }
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::LocalDevice(index) => write!(f, "/dev/video{index}"),
            SourceDescriptor::Remote(uri) => f.write_str(uri),
        }
    }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<u32> {
    if let Ok(index) = uri.parse::<u32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<u32>().ok();
        }
    }
    None
}
