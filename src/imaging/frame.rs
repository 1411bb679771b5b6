//! Camera frames and the metadata needed to relate pixels to global space.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::{imageops, ImageBuffer, Luma};
use nalgebra::{Affine2, Matrix3, Vector2};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};

/// Single-channel floating point image used for frames and templates.
pub type FrameImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Opaque identifier for the optical configuration (camera, objective,
/// filter) a reference set was captured with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigKey(String);

impl ConfigKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Integer pixel rectangle `[min, max)` within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBox {
    pub min: [i64; 2],
    pub max: [i64; 2],
}

impl CropBox {
    pub fn new(min: [i64; 2], max: [i64; 2]) -> Self {
        Self { min, max }
    }

    pub fn width(&self) -> i64 {
        self.max[0] - self.min[0]
    }

    pub fn height(&self) -> i64 {
        self.max[1] - self.min[1]
    }

    /// Whether both extents are at least one pixel.
    pub fn is_valid(&self) -> bool {
        self.width() >= 1 && self.height() >= 1
    }
}

impl fmt::Display for CropBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}]..[{}, {}]",
            self.min[0], self.min[1], self.max[0], self.max[1]
        )
    }
}

/// A camera frame with its pixel-to-global affine transform.
///
/// Pixel data is shared, so cloning a frame is cheap.
#[derive(Debug, Clone)]
pub struct Frame {
    data: Arc<FrameImage>,
    pixel_to_global: Affine2<f64>,
    global_to_pixel: Affine2<f64>,
    pixel_size: Vector2<f64>,
    depth: f64,
    acquired_at: DateTime<Utc>,
}

impl Frame {
    /// Create a frame from pixel data, the pixel-to-global transform of the
    /// focal plane and the focal plane depth (global z).
    pub fn new(data: FrameImage, pixel_to_global: Affine2<f64>, depth: f64) -> Result<Self> {
        let global_to_pixel = pixel_to_global
            .try_inverse()
            .ok_or(TrackerError::SingularTransform)?;
        let pixel_size = Vector2::new(
            pixel_to_global.transform_vector(&Vector2::x()).norm(),
            pixel_to_global.transform_vector(&Vector2::y()).norm(),
        );

        Ok(Self {
            data: Arc::new(data),
            pixel_to_global,
            global_to_pixel,
            pixel_size,
            depth,
            acquired_at: Utc::now(),
        })
    }

    /// Axis-aligned frame: pixel `(0, 0)` maps to `origin` and each pixel
    /// spans `pixel_size` metres.
    pub fn axis_aligned(
        data: FrameImage,
        origin: Vector2<f64>,
        pixel_size: Vector2<f64>,
        depth: f64,
    ) -> Result<Self> {
        let matrix = Matrix3::new(
            pixel_size.x, 0.0, origin.x,
            0.0, pixel_size.y, origin.y,
            0.0, 0.0, 1.0,
        );
        Self::new(data, Affine2::from_matrix_unchecked(matrix), depth)
    }

    /// Same geometry and timestamp, different pixels.
    pub fn with_data(&self, data: FrameImage) -> Self {
        Self {
            data: Arc::new(data),
            ..self.clone()
        }
    }

    pub fn data(&self) -> &FrameImage {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.data.width()
    }

    pub fn height(&self) -> u32 {
        self.data.height()
    }

    pub fn pixel_size(&self) -> Vector2<f64> {
        self.pixel_size
    }

    /// Pixel-to-global transform of the focal plane.
    pub fn transform(&self) -> &Affine2<f64> {
        &self.pixel_to_global
    }

    /// Global-to-pixel transform of the focal plane.
    pub fn inverse_transform(&self) -> &Affine2<f64> {
        &self.global_to_pixel
    }

    /// Global z of the focal plane when the frame was exposed.
    pub fn depth(&self) -> f64 {
        self.depth
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Copy the pixels inside `region`. The region must lie within the frame.
    pub fn crop(&self, region: &CropBox) -> FrameImage {
        crop_image(&self.data, region)
    }
}

/// Copy the pixels of `image` inside `region`.
pub fn crop_image(image: &FrameImage, region: &CropBox) -> FrameImage {
    let x = region.min[0].max(0) as u32;
    let y = region.min[1].max(0) as u32;
    let width = region.width().max(0) as u32;
    let height = region.height().max(0) as u32;
    imageops::crop_imm(image, x, y, width, height).to_image()
}

/// Pixel-wise `a - b`. Both images must have the same dimensions.
pub fn subtract(a: &FrameImage, b: &FrameImage) -> Result<FrameImage> {
    if a.dimensions() != b.dimensions() {
        return Err(TrackerError::ImageSizeMismatch {
            expected: a.dimensions(),
            actual: b.dimensions(),
        });
    }
    let data = a
        .as_raw()
        .iter()
        .zip(b.as_raw().iter())
        .map(|(x, y)| x - y)
        .collect();
    FrameImage::from_raw(a.width(), a.height(), data).ok_or(TrackerError::ImageSizeMismatch {
        expected: a.dimensions(),
        actual: b.dimensions(),
    })
}
