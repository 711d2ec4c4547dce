//! Object detection capability consumed by the processing stages.
//!
//! The model itself is opaque: anything that turns a [`video_ingest::Frame`]
//! into a list of scored boxes implements [`Detector`]. Enable the `with-tch`
//! feature for the TorchScript backend.

mod detector;
mod preprocess;
#[cfg(feature = "with-tch")]
mod torch;

pub use detector::{Detection, Detector, DetectorError, SSD_CLASS_LABELS, load_labels};
pub use preprocess::Preprocessing;
#[cfg(feature = "with-tch")]
pub use torch::TorchDetector;

#[cfg(feature = "with-tch")]
pub use tch;
