//! Imaging primitives: frames, pixel/global coordinate mapping and correlation.

pub mod correlation;
mod frame;
pub mod mapper;

pub use correlation::{best_match, ncc_at, ncc_map, CorrelationPeak};
pub use frame::{crop_image, subtract, ConfigKey, CropBox, Frame, FrameImage};
pub use mapper::{to_global, to_pixel, vector_to_pixel};
