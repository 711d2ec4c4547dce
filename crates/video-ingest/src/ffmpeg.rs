//! FFmpeg-backed frame source decoding any input to raw BGR24.

use std::{
    io::{ErrorKind, Read},
    process::{Child, ChildStdout, Command, Stdio},
};

use anyhow::anyhow;
use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    source::{FrameSource, SourceDescriptor},
    types::{CaptureError, Frame, FrameFormat},
};

/// Decodes a camera, stream, or file through an `ffmpeg` child process.
///
/// ffmpeg scales every frame to `target_size` so each read is a fixed number
/// of bytes.
pub struct FfmpegSource {
    uri: String,
    child: Child,
    stdout: ChildStdout,
    target_size: (u32, u32),
    buffer: Vec<u8>,
}

impl FfmpegSource {
    pub fn open(source: &SourceDescriptor, target_size: (u32, u32)) -> Result<Self, CaptureError> {
        let uri = source.to_string();
        let mut cmd = build_command(source, target_size);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        debug!("spawning ffmpeg for {uri} at {}x{}", target_size.0, target_size.1);
        let mut child = cmd.spawn().map_err(|err| {
            warn!("video-ingest: failed to spawn ffmpeg for {uri}: {err}");
            CaptureError::Open { uri: uri.clone() }
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

        let frame_bytes = Frame::byte_len(target_size.0, target_size.1, FrameFormat::Bgr8);
        Ok(Self {
            uri,
            child,
            stdout,
            target_size,
            buffer: vec![0u8; frame_bytes],
        })
    }

    fn exit_reason(&mut self, err: std::io::Error) -> String {
        match self.child.try_wait() {
            Ok(Some(status)) => format!("ffmpeg exited with {status}"),
            _ if err.kind() == ErrorKind::UnexpectedEof => "stream ended".to_string(),
            _ => err.to_string(),
        }
    }
}

impl FrameSource for FfmpegSource {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        if let Err(err) = self.stdout.read_exact(&mut self.buffer) {
            let reason = self.exit_reason(err);
            return Err(CaptureError::unavailable(&self.uri, reason));
        }
        let timestamp_ms = Utc::now().timestamp_millis();
        Frame::from_bgr(
            self.buffer.clone(),
            self.target_size.0,
            self.target_size.1,
            timestamp_ms,
        )
    }

    fn describe(&self) -> String {
        self.uri.clone()
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn build_command(source: &SourceDescriptor, target_size: (u32, u32)) -> Command {
    let scale_arg = format!("scale={}:{}", target_size.0, target_size.1);
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");

    match source {
        SourceDescriptor::LocalDevice(index) => {
            cmd.arg("-f")
                .arg("video4linux2")
                .arg("-i")
                .arg(format!("/dev/video{index}"));
        }
        remote if remote.is_rtsp() => {
            cmd.arg("-rtsp_transport")
                .arg("tcp")
                .arg("-fflags")
                .arg("nobuffer")
                .arg("-flags")
                .arg("low_delay")
                .arg("-i")
                .arg(remote.to_string());
        }
        SourceDescriptor::Remote(uri) => {
            cmd.arg("-i").arg(uri);
        }
    }

    cmd.arg("-an")
        .arg("-vf")
        .arg(&scale_arg)
        .arg("-pix_fmt")
        .arg("bgr24")
        .arg("-f")
        .arg("rawvideo")
        .arg("-");
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn local_device_uses_v4l2() {
        let cmd = build_command(&SourceDescriptor::LocalDevice(1), (640, 480));
        let args = args(&cmd);
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input - 1], "video4linux2");
        assert_eq!(args[input + 1], "/dev/video1");
        assert!(args.contains(&"scale=640:480".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn rtsp_forces_tcp_transport() {
        let source = SourceDescriptor::Remote("rtsp://cam.local/live".into());
        let args = args(&build_command(&source, (320, 240)));
        let transport = args.iter().position(|a| a == "-rtsp_transport").unwrap();
        assert_eq!(args[transport + 1], "tcp");
        assert!(args.contains(&"rtsp://cam.local/live".to_string()));
    }

    #[test]
    fn http_stream_is_passed_verbatim() {
        let source = SourceDescriptor::Remote("http://10.0.0.2:8080/video".into());
        let args = args(&build_command(&source, (320, 240)));
        assert!(!args.contains(&"-rtsp_transport".to_string()));
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "http://10.0.0.2:8080/video");
    }
}
