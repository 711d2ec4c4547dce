use image::{GrayImage, Luma};
use imageproc::{
    distance_transform::Norm,
    filter::gaussian_blur_f32,
    morphology::dilate,
    region_labelling::{Connectivity, connected_components},
};
use tracing::{debug, warn};
use video_ingest::Frame;

use crate::{
    annotation::{GREEN, annotate, draw_box},
    error::PipelineError,
    pipeline::config::MotionOptions,
    processing::FrameProcessor,
    tracker::BoundingBox,
};

/// Sigma matching a 21x21 Gaussian kernel.
const BLUR_SIGMA: f32 = 3.5;
/// Two 3x3 dilation passes grow a region by two pixels in every direction.
const DILATE_RADIUS: u8 = 2;
const BOX_THICKNESS: u32 = 2;

/// Grayscale (BT.601 luma) and blurred copy of a BGR frame.
pub(crate) fn prepare_gray(frame: &Frame) -> GrayImage {
    let mut gray = GrayImage::new(frame.width, frame.height);
    for (pixel, bgr) in gray.pixels_mut().zip(frame.data.chunks_exact(3)) {
        let luma =
            0.114 * f32::from(bgr[0]) + 0.587 * f32::from(bgr[1]) + 0.299 * f32::from(bgr[2]);
        *pixel = Luma([luma.round().clamp(0.0, 255.0) as u8]);
    }
    gaussian_blur_f32(&gray, BLUR_SIGMA)
}

/// Bounding boxes of the changed regions between two prepared frames.
///
/// Pixels whose difference exceeds `tolerance` form the motion mask, which is
/// dilated and split into 8-connected regions; regions with fewer than
/// `min_area` pixels are dropped. Boxes come out in raster order of each
/// region's first pixel.
pub(crate) fn motion_regions(
    reference: &GrayImage,
    current: &GrayImage,
    options: &MotionOptions,
) -> Vec<BoundingBox> {
    let mut mask = GrayImage::new(current.width(), current.height());
    for ((out, a), b) in mask.pixels_mut().zip(reference.pixels()).zip(current.pixels()) {
        if a[0].abs_diff(b[0]) > options.tolerance {
            *out = Luma([255]);
        }
    }
    let mask = dilate(&mask, Norm::LInf, DILATE_RADIUS);
    let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

    struct Region {
        bbox: BoundingBox,
        area: u32,
    }
    let mut regions: Vec<Option<Region>> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0] as usize;
        if label == 0 {
            continue;
        }
        if regions.len() < label {
            regions.resize_with(label, || None);
        }
        let (x, y) = (x as i32, y as i32);
        match &mut regions[label - 1] {
            Some(region) => {
                region.bbox.x_min = region.bbox.x_min.min(x);
                region.bbox.y_min = region.bbox.y_min.min(y);
                region.bbox.x_max = region.bbox.x_max.max(x);
                region.bbox.y_max = region.bbox.y_max.max(y);
                region.area += 1;
            }
            slot @ None => {
                *slot = Some(Region {
                    bbox: BoundingBox::new(x, y, x, y),
                    area: 1,
                });
            }
        }
    }

    regions
        .into_iter()
        .flatten()
        .filter(|region| region.area >= options.min_area)
        .map(|region| region.bbox)
        .collect()
}

fn draw_regions(frame: &mut Frame, regions: &[BoundingBox]) -> Result<(), PipelineError> {
    if regions.is_empty() {
        return Ok(());
    }
    annotate(frame, |image| {
        for region in regions {
            draw_box(image, region, GREEN, BOX_THICKNESS);
        }
    })
}

/// Motion against a fixed reference frame.
pub struct AbsoluteMotion {
    reference: GrayImage,
    options: MotionOptions,
}

impl AbsoluteMotion {
    pub fn new(reference: &Frame, options: MotionOptions) -> Self {
        Self {
            reference: prepare_gray(reference),
            options,
        }
    }
}

impl FrameProcessor for AbsoluteMotion {
    fn name(&self) -> &'static str {
        "abs_motion"
    }

    fn process(&mut self, mut frame: Frame) -> Result<Frame, PipelineError> {
        if frame.dimensions() != self.reference.dimensions() {
            let (rw, rh) = self.reference.dimensions();
            return Err(PipelineError::InvalidFrame(format!(
                "frame is {}x{} but the motion reference is {rw}x{rh}",
                frame.width, frame.height
            )));
        }
        let current = prepare_gray(&frame);
        let regions = motion_regions(&self.reference, &current, &self.options);
        if !regions.is_empty() {
            debug!("abs_motion: {} region(s) in frame {}", regions.len(), frame.sequence);
        }
        draw_regions(&mut frame, &regions)?;
        Ok(frame)
    }
}

/// Motion against the previous frame.
///
/// The first frame only becomes the reference and is returned untouched.
pub struct RelativeMotion {
    previous: Option<GrayImage>,
    options: MotionOptions,
}

impl RelativeMotion {
    pub fn new(options: MotionOptions) -> Self {
        Self {
            previous: None,
            options,
        }
    }
}

impl FrameProcessor for RelativeMotion {
    fn name(&self) -> &'static str {
        "rel_motion"
    }

    fn process(&mut self, mut frame: Frame) -> Result<Frame, PipelineError> {
        let previous = self.previous.replace(prepare_gray(&frame));
        let (Some(previous), Some(current)) = (previous, self.previous.as_ref()) else {
            return Ok(frame);
        };
        if previous.dimensions() != current.dimensions() {
            warn!(
                "rel_motion: frame size changed to {}x{}, resetting reference",
                frame.width, frame.height
            );
            return Ok(frame);
        }
        let regions = motion_regions(&previous, current, &self.options);
        draw_regions(&mut frame, &regions)?;
        Ok(frame)
    }
}
