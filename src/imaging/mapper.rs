//! Conversion between global physical coordinates and frame pixel coordinates.
//!
//! Global x/y map through the frame's affine transform; global z is the
//! frame's focal plane depth.

use nalgebra::{Point2, Point3, Vector2};

use super::frame::Frame;

/// Map a global position into the frame's pixel space. The z component is ignored.
pub fn to_pixel(frame: &Frame, global: &Point3<f64>) -> Point2<f64> {
    frame
        .inverse_transform()
        .transform_point(&Point2::new(global.x, global.y))
}

/// Map a pixel position onto the frame's focal plane in global space.
pub fn to_global(frame: &Frame, pixel: &Point2<f64>) -> Point3<f64> {
    let p = frame.transform().transform_point(pixel);
    Point3::new(p.x, p.y, frame.depth())
}

/// Map a global displacement (x/y) into a pixel displacement.
pub fn vector_to_pixel(frame: &Frame, global: &Vector2<f64>) -> Vector2<f64> {
    frame.inverse_transform().transform_vector(global)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::FrameImage;
    use nalgebra::{Affine2, Matrix3};

    fn rotated_frame() -> Frame {
        let (s, c) = 0.3_f64.sin_cos();
        let px = 0.8e-6;
        let matrix = Matrix3::new(
            c * px, -s * px * 1.1, 12e-6,
            s * px, c * px * 1.1, -7e-6,
            0.0, 0.0, 1.0,
        );
        Frame::new(FrameImage::new(32, 32), Affine2::from_matrix_unchecked(matrix), 5e-6).unwrap()
    }

    #[test]
    fn test_round_trip_pixel_global_pixel() {
        let frame = rotated_frame();
        for &(x, y) in &[(0.0, 0.0), (10.5, 3.25), (-4.0, 100.0), (31.9, 0.1)] {
            let pixel = Point2::new(x, y);
            let back = to_pixel(&frame, &to_global(&frame, &pixel));
            assert!((back - pixel).norm() < 1e-9, "{:?} != {:?}", back, pixel);
        }
    }

    #[test]
    fn test_to_global_uses_focal_depth() {
        let frame = rotated_frame();
        let g = to_global(&frame, &Point2::new(1.0, 2.0));
        assert_eq!(g.z, 5e-6);
    }

    #[test]
    fn test_vector_mapping_ignores_translation() {
        let frame = rotated_frame();
        let origin = to_pixel(&frame, &Point3::origin());
        let tip = to_pixel(&frame, &Point3::new(3e-6, -2e-6, 0.0));
        let v = vector_to_pixel(&frame, &Vector2::new(3e-6, -2e-6));
        assert!(((tip - origin) - v).norm() < 1e-9);
    }
}
