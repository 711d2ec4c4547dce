use anyhow::Error;
use thiserror::Error;

/// Raw frame captured from a video source.
///
/// Pixels are stored row-major, `height` rows of `width` pixels with
/// [`FrameFormat::channels`] interleaved bytes each.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    /// Capture order assigned by the acquisition loop, starting at 0.
    pub sequence: u64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn channels(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }
}

impl Frame {
    /// Build a BGR8 frame, checking that the buffer matches the dimensions.
    pub fn from_bgr(
        data: Vec<u8>,
        width: u32,
        height: u32,
        timestamp_ms: i64,
    ) -> Result<Self, CaptureError> {
        let expected = Self::byte_len(width, height, FrameFormat::Bgr8);
        if data.len() != expected {
            return Err(CaptureError::Other(anyhow::anyhow!(
                "frame buffer for {width}x{height} has {} bytes, expected {expected}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp_ms,
            sequence: 0,
            format: FrameFormat::Bgr8,
        })
    }

    /// Solid-colour frame, mostly useful for tests and placeholders.
    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        let pixels = (width as usize) * (height as usize);
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&bgr);
        }
        Self {
            data,
            width,
            height,
            timestamp_ms: 0,
            sequence: 0,
            format: FrameFormat::Bgr8,
        }
    }

    pub fn byte_len(width: u32, height: u32, format: FrameFormat) -> usize {
        (width as usize) * (height as usize) * format.channels()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    /// The device or stream can no longer produce frames.
    #[error("video source {uri:?} unavailable: {reason}")]
    SourceUnavailable { uri: String, reason: String },
    #[error(transparent)]
    Other(#[from] Error),
}

impl CaptureError {
    pub fn unavailable(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        CaptureError::SourceUnavailable {
            uri: uri.into(),
            reason: reason.into(),
        }
    }
}
