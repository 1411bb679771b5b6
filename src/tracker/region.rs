//! Planning of the image region that contains the pipette tip.

use std::f64::consts::PI;

use nalgebra::{Point3, Vector2};

use crate::error::{Result, TrackerError};
use crate::imaging::{to_pixel, vector_to_pixel, CropBox, Frame};

/// Half-angle of the triangle that circumscribes the tip.
pub const TIP_HALF_ANGLE: f64 = 10.0 * PI / 180.0;

/// Pixel region to extract around the tip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TipImageRegion {
    /// Clipped pixel bounds, `min` inclusive and `max` exclusive.
    pub bounds: CropBox,
    /// Subpixel location of the tip relative to `bounds.min`.
    pub tip_rel_pos: Vector2<f64>,
}

impl TipImageRegion {
    pub fn min_img_pos(&self) -> [i64; 2] {
        self.bounds.min
    }

    pub fn max_img_pos(&self) -> [i64; 2] {
        self.bounds.max
    }
}

/// Suggested tip length to image: the length of 100 pixels in the frame.
pub fn suggest_tip_length(frame: &Frame) -> f64 {
    frame.pixel_size().x * 100.0
}

/// Computes a pixel box around the expected tip location.
///
/// The box size depends only on yaw, tip length, padding and pixel size, so
/// crops keep the same dimensions while the tip moves across the frame
/// (until they are clipped at the frame edge).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TipRegionPlanner {
    /// Padding around the tip silhouette, in metres.
    pub padding: f64,
    /// Pipette orientation in the global x/y plane.
    pub yaw: f64,
    /// Imaged tip length in metres; defaults to [`suggest_tip_length`].
    pub tip_length: Option<f64>,
}

impl TipRegionPlanner {
    pub fn new(padding: f64, yaw: f64) -> Self {
        Self {
            padding,
            yaw,
            tip_length: None,
        }
    }

    pub fn with_tip_length(mut self, tip_length: f64) -> Self {
        self.tip_length = Some(tip_length);
        self
    }

    /// Corners of the unclipped box relative to the tip pixel.
    pub fn relative_bounds(&self, frame: &Frame) -> ([i64; 2], [i64; 2]) {
        let length = self
            .tip_length
            .unwrap_or_else(|| suggest_tip_length(frame));

        // back points of a triangle that circumscribes the tip
        let back1 = Vector2::new(
            -length * (self.yaw + TIP_HALF_ANGLE).cos(),
            -length * (self.yaw + TIP_HALF_ANGLE).sin(),
        );
        let back2 = Vector2::new(
            -length * (self.yaw - TIP_HALF_ANGLE).cos(),
            -length * (self.yaw - TIP_HALF_ANGLE).sin(),
        );
        let corners = [
            Vector2::zeros(),
            vector_to_pixel(frame, &back1),
            vector_to_pixel(frame, &back2),
        ];

        let padding = (self.padding / frame.pixel_size().x) as i64;
        let mut min = [i64::MAX; 2];
        let mut max = [i64::MIN; 2];
        for corner in &corners {
            for axis in 0..2 {
                let v = corner[axis] as i64;
                min[axis] = min[axis].min(v);
                max[axis] = max[axis].max(v);
            }
        }

        (
            [min[0] - padding, min[1] - padding],
            [max[0] + padding, max[1] + padding],
        )
    }

    /// Plan the crop around a tip expected at global position `tip`.
    pub fn plan(&self, frame: &Frame, tip: &Point3<f64>) -> Result<TipImageRegion> {
        let (mut min_rel, mut max_rel) = self.relative_bounds(frame);

        let tip_img = to_pixel(frame, tip);
        let tip_px = [tip_img.x.floor() as i64, tip_img.y.floor() as i64];
        let dims = [frame.width() as i64, frame.height() as i64];

        for axis in 0..2 {
            let lo = -tip_px[axis];
            let hi = dims[axis] - 1 - tip_px[axis];
            min_rel[axis] = min_rel[axis].max(lo).min(hi);
            max_rel[axis] = max_rel[axis].max(lo).min(hi);
        }

        let bounds = CropBox::new(
            [tip_px[0] + min_rel[0], tip_px[1] + min_rel[1]],
            [tip_px[0] + max_rel[0], tip_px[1] + max_rel[1]],
        );
        if !bounds.is_valid() {
            return Err(TrackerError::TipOutOfFrame { region: bounds });
        }

        let tip_rel_pos = Vector2::new(
            tip_img.x - (tip_px[0] + min_rel[0]) as f64,
            tip_img.y - (tip_px[1] + min_rel[1]) as f64,
        );

        Ok(TipImageRegion {
            bounds,
            tip_rel_pos,
        })
    }
}
