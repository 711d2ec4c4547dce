//! OpenCV-backed camera capture.

use chrono::Utc;
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::warn;

use crate::{
    source::{FrameSource, SourceDescriptor},
    types::{CaptureError, Frame},
};

/// Frame source reading from an OpenCV `VideoCapture`.
pub struct OpenCvSource {
    uri: String,
    cap: VideoCapture,
    frame: Mat,
    scratch: Mat,
    target_size: (u32, u32),
}

impl OpenCvSource {
    pub fn open(source: &SourceDescriptor, target_size: (u32, u32)) -> Result<Self, CaptureError> {
        let uri = source.to_string();
        let mut cap = open_video_capture(source)?;
        configure_camera(&mut cap, target_size, 30.0);
        Ok(Self {
            uri,
            cap,
            frame: Mat::default(),
            scratch: Mat::default(),
            target_size,
        })
    }

    fn unavailable(&self, err: impl std::fmt::Display) -> CaptureError {
        CaptureError::unavailable(&self.uri, err.to_string())
    }
}

impl FrameSource for OpenCvSource {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        let grabbed = self
            .cap
            .read(&mut self.frame)
            .map_err(|e| self.unavailable(e))?;
        let size = self.frame.size().map_err(|e| self.unavailable(e))?;
        if !grabbed || size.width <= 0 {
            return Err(self.unavailable("no frame returned"));
        }

        let (target_w, target_h) = self.target_size;
        let working = if size.width != target_w as i32 || size.height != target_h as i32 {
            opencv::imgproc::resize(
                &self.frame,
                &mut self.scratch,
                core::Size {
                    width: target_w as i32,
                    height: target_h as i32,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::Other(e.into()))?;
            &self.scratch
        } else {
            &self.frame
        };

        let data = working
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        Frame::from_bgr(data, target_w, target_h, Utc::now().timestamp_millis())
    }

    fn describe(&self) -> String {
        self.uri.clone()
    }
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(source: &SourceDescriptor) -> Result<VideoCapture, CaptureError> {
    let uri = source.to_string();
    if let SourceDescriptor::LocalDevice(index) = source {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(*index as i32, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!(
                        "video-ingest: failed to open device #{index} with backend {backend}: {err}"
                    );
                }
            }
        }
    }

    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::from_file(&uri, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                warn!("video-ingest: failed to open {uri} with backend {backend}: {err}");
            }
        }
    }

    Err(CaptureError::Open { uri })
}

/// Apply common capture settings (resolution, fps, preferred pixel format).
fn configure_camera(cap: &mut VideoCapture, target_size: (u32, u32), fps: f64) {
    let mut fourcc_set = false;
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        if matches!(cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64), Ok(true)) {
            fourcc_set = true;
        }
    }
    if !fourcc_set {
        if let Ok(yuyv) = videoio::VideoWriter::fourcc('Y', 'U', 'Y', 'V') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, yuyv as f64);
        }
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}
