use std::{convert::TryFrom, path::Path};

use anyhow::anyhow;
use tch::{self, Device, Kind, Tensor};
use tracing::debug;
use video_ingest::Frame;

use crate::{
    detector::{Detection, Detector, DetectorError, SSD_CLASS_LABELS},
    preprocess::Preprocessing,
};

/// Columns per SSD detection row: image id, class id, score, then a
/// normalized `x_min, y_min, x_max, y_max` box.
const SSD_ROW: i64 = 7;
const MAX_DETECTIONS: usize = 512;

/// TorchScript-backed SSD detector.
///
/// The module receives a `[1, 3, H, W]` float tensor in BGR order prepared by
/// its [`Preprocessing`] (MobileNet-SSD by default), and must return SSD style
/// rows of seven values (any leading shape that flattens to `[N, 7]`).
pub struct TorchDetector {
    module: tch::CModule,
    device: Device,
    preprocessing: Preprocessing,
    labels: Vec<String>,
}

impl TorchDetector {
    /// Load a TorchScript module on CUDA when available, CPU otherwise.
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        labels: Option<Vec<String>>,
    ) -> Result<Self, DetectorError> {
        let path = model_path.as_ref();
        let device = Device::cuda_if_available();
        let module =
            tch::CModule::load_on_device(path, device).map_err(|err| DetectorError::Load {
                path: path.to_path_buf(),
                source: err.into(),
            })?;
        debug!("loaded detector {} on {device:?}", path.display());
        Ok(Self {
            module,
            device,
            preprocessing: Preprocessing::default(),
            labels: labels
                .unwrap_or_else(|| SSD_CLASS_LABELS.iter().map(|l| l.to_string()).collect()),
        })
    }

    pub fn with_preprocessing(mut self, preprocessing: Preprocessing) -> Self {
        self.preprocessing = preprocessing;
        self
    }

    fn frame_to_tensor(&self, frame: &Frame) -> Result<Tensor, DetectorError> {
        let expected = Frame::byte_len(frame.width, frame.height, frame.format);
        if frame.data.len() != expected {
            return Err(DetectorError::InvalidInput(format!(
                "unexpected frame buffer size: got {} bytes, expected {expected}",
                frame.data.len()
            )));
        }

        let mut tensor = Tensor::from_slice(&frame.data)
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, frame.height as i64, frame.width as i64, 3])
            .permute([0, 3, 1, 2]);
        let (in_w, in_h) = self.preprocessing.input_dimensions(frame.width, frame.height);
        if (in_w, in_h) != (frame.width, frame.height) {
            tensor = tensor.upsample_bilinear2d([in_h as i64, in_w as i64], false, None, None);
        }

        let mean = Tensor::from_slice(&self.preprocessing.mean)
            .to_device(self.device)
            .view([1, 3, 1, 1]);
        Ok((tensor - mean) * f64::from(self.preprocessing.scale))
    }

    fn decode(
        &self,
        output: &Tensor,
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>, DetectorError> {
        let numel = output.numel() as i64;
        if numel % SSD_ROW != 0 {
            return Err(DetectorError::Inference(anyhow!(
                "unexpected detector output shape: {:?}",
                output.size()
            )));
        }

        let rows = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .reshape([-1, SSD_ROW])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&rows).map_err(anyhow::Error::from)?;

        let (w, h) = (width as f32, height as f32);
        let mut detections = Vec::new();
        for row in rows {
            let class_id = row[1];
            let score = row[2];
            if score <= 0.0 {
                continue;
            }
            let bbox = [row[3] * w, row[4] * h, row[5] * w, row[6] * h];
            let mut detection = Detection::new(bbox, score);
            if class_id >= 0.0 {
                if let Some(label) = self.labels.get(class_id as usize) {
                    detection = detection.with_label(label.clone());
                }
            }
            detections.push(detection);
            if detections.len() >= MAX_DETECTIONS {
                break;
            }
        }
        Ok(detections)
    }
}

impl Detector for TorchDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        let input = self.frame_to_tensor(frame)?;
        let output =
            tch::no_grad(|| self.module.forward_ts(&[input])).map_err(anyhow::Error::from)?;
        self.decode(&output, frame.width, frame.height)
    }
}
