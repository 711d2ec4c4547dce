use std::{
    fs,
    path::{Path, PathBuf},
};

use thiserror::Error;
use video_ingest::Frame;

/// Class names of the 21-class VOC MobileNet-SSD model, index 0 is background.
pub const SSD_CLASS_LABELS: [&str; 21] = [
    "background",
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "diningtable",
    "dog",
    "horse",
    "motorbike",
    "person",
    "pottedplant",
    "sheep",
    "sofa",
    "train",
    "tvmonitor",
];

/// Single detection returned by a detector.
///
/// `bbox` is `[x_min, y_min, x_max, y_max]` in frame pixel coordinates. Values
/// come straight from the model and are validated by the caller.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Detection {
    pub bbox: [f32; 4],
    pub score: f32,
    pub label: Option<String>,
}

impl Detection {
    pub fn new(bbox: [f32; 4], score: f32) -> Self {
        Self {
            bbox,
            score,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn is_finite(&self) -> bool {
        self.score.is_finite() && self.bbox.iter().all(|v| v.is_finite())
    }
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("failed to load detector model {path:?}")]
    Load {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to read label file {path:?}")]
    Labels {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("detector rejected frame: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Inference(#[from] anyhow::Error),
}

/// Given a frame, produce zero or more scored boxes.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError>;
}

impl Detector for Box<dyn Detector> {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        (**self).detect(frame)
    }
}

/// Read one class name per line, skipping blank lines.
pub fn load_labels(path: impl AsRef<Path>) -> Result<Vec<String>, DetectorError> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).map_err(|source| DetectorError::Labels {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_file_skips_blank_lines() {
        let path = std::env::temp_dir().join(format!("ml-core-labels-{}.txt", std::process::id()));
        fs::write(&path, "person\n\n  car \nbicycle\n").unwrap();
        let labels = load_labels(&path).unwrap();
        fs::remove_file(&path).ok();
        assert_eq!(labels, vec!["person", "car", "bicycle"]);
    }

    #[test]
    fn missing_labels_file_is_reported() {
        let err = load_labels("/nonexistent/labels.txt").unwrap_err();
        assert!(matches!(err, DetectorError::Labels { .. }));
    }

    #[test]
    fn non_finite_detections_are_flagged() {
        assert!(Detection::new([0.0, 0.0, 4.0, 4.0], 0.9).is_finite());
        assert!(!Detection::new([f32::NAN, 0.0, 4.0, 4.0], 0.9).is_finite());
        assert!(!Detection::new([0.0, 0.0, 4.0, 4.0], f32::INFINITY).is_finite());
    }
}
