//! Tip localization against a reference stack.

use nalgebra::{Point2, Point3};

use super::reference::ReferenceSet;
use super::region::TipImageRegion;
use crate::imaging::{best_match, subtract, to_global, Frame};

/// Result of one localization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// Estimated tip position in global coordinates.
    pub position: Point3<f64>,
    /// Match quality in [0, 1], higher is better.
    pub confidence: f64,
    /// Index of the best matching reference frame, if any matched.
    pub slice: Option<usize>,
}

/// Strategy that locates the tip inside a planned region of a frame.
pub trait TipDetector: Send + Sync {
    /// Locate the tip within `region` of `frame`.
    ///
    /// `background`, when given, is a frame of the same field of view
    /// without the pipette and is subtracted before matching.
    fn locate(
        &self,
        frame: &Frame,
        region: &TipImageRegion,
        reference: &ReferenceSet,
        background: Option<&Frame>,
    ) -> Detection;
}

/// Normalized cross-correlation against every frame of the reference stack.
///
/// The best matching frame gives the tip depth relative to the focal plane,
/// the correlation peak gives the in-plane position.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateMatchDetector;

impl TipDetector for TemplateMatchDetector {
    fn locate(
        &self,
        frame: &Frame,
        region: &TipImageRegion,
        reference: &ReferenceSet,
        background: Option<&Frame>,
    ) -> Detection {
        let scale = frame.pixel_size().x / reference.pixel_size.x;
        if (scale - 1.0).abs() > 0.01 {
            tracing::warn!(
                "Frame pixel size differs from reference by {:.1}%",
                (scale - 1.0) * 100.0
            );
        }

        let mut crop = frame.crop(&region.bounds);
        if let Some(background) = background {
            match subtract(&crop, &background.crop(&region.bounds)) {
                Ok(diff) => crop = diff,
                Err(e) => {
                    tracing::warn!("Background frame not usable: {}", e);
                    return unmatched(frame, region);
                }
            }
        }

        let best = reference
            .frames
            .iter()
            .enumerate()
            .filter_map(|(i, template)| best_match(&crop, template).map(|peak| (i, peak)))
            .max_by(|a, b| a.1.score.total_cmp(&b.1.score));

        let min = region.min_img_pos();
        match best {
            Some((slice, peak)) => {
                let pixel = Point2::new(
                    min[0] as f64 + peak.offset.0 + reference.center_pos.x,
                    min[1] as f64 + peak.offset.1 + reference.center_pos.y,
                );
                let mut position = to_global(frame, &pixel);
                position.z += reference.relative_depth(slice);
                tracing::debug!(
                    "Best match in reference frame {} (score {:.3}) at {:?}",
                    slice,
                    peak.score,
                    position
                );

                Detection {
                    position,
                    confidence: peak.score.clamp(0.0, 1.0),
                    slice: Some(slice),
                }
            }
            // Templates larger than the crop cannot match anywhere.
            None => unmatched(frame, region),
        }
    }
}

/// Zero-confidence detection at the planned tip position.
fn unmatched(frame: &Frame, region: &TipImageRegion) -> Detection {
    let min = region.min_img_pos();
    let pixel = Point2::new(
        min[0] as f64 + region.tip_rel_pos.x,
        min[1] as f64 + region.tip_rel_pos.y,
    );
    Detection {
        position: to_global(frame, &pixel),
        confidence: 0.0,
        slice: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::{CropBox, FrameImage};
    use image::Luma;
    use nalgebra::Vector2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn blob(width: u32, height: u32, cx: f32, cy: f32) -> FrameImage {
        FrameImage::from_fn(width, height, |x, y| {
            let d2 = (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2);
            Luma([-50.0 * (-d2 / 8.0).exp() + 2.0 * (x as f32 / 3.0).sin()])
        })
    }

    fn frame(data: FrameImage, depth: f64) -> Frame {
        Frame::axis_aligned(data, Vector2::zeros(), Vector2::new(1e-6, 1e-6), depth).unwrap()
    }

    fn full_region(frame: &Frame, tip_rel: Vector2<f64>) -> TipImageRegion {
        TipImageRegion {
            bounds: CropBox::new([0, 0], [frame.width() as i64, frame.height() as i64]),
            tip_rel_pos: tip_rel,
        }
    }

    #[test]
    fn test_locates_shifted_template() {
        let template = blob(16, 16, 8.0, 8.0);
        let reference = ReferenceSet::new(
            vec![template],
            1e-6,
            0,
            Vector2::new(8.0, 8.0),
            Vector2::new(1e-6, 1e-6),
            10e-6,
        )
        .unwrap();

        let image = frame(blob(48, 40, 30.0, 17.0), 3e-6);
        let region = full_region(&image, Vector2::new(24.0, 20.0));
        let detection = TemplateMatchDetector.locate(&image, &region, &reference, None);

        assert!(detection.confidence > 0.95);
        assert!((detection.position.x - 30e-6).abs() < 0.3e-6);
        assert!((detection.position.y - 17e-6).abs() < 0.3e-6);
        assert!((detection.position.z - 3e-6).abs() < 1e-12);
    }

    #[test]
    fn test_best_slice_sets_depth() {
        let sharp = blob(16, 16, 8.0, 8.0);
        let wide = FrameImage::from_fn(16, 16, |x, y| {
            let d2 = (x as f32 - 8.0).powi(2) + (y as f32 - 8.0).powi(2);
            Luma([-50.0 * (-d2 / 60.0).exp()])
        });
        let reference = ReferenceSet::new(
            vec![wide.clone(), sharp, wide],
            2e-6,
            1,
            Vector2::new(8.0, 8.0),
            Vector2::new(1e-6, 1e-6),
            10e-6,
        )
        .unwrap();

        let image = frame(blob(32, 32, 16.0, 16.0), 0.0);
        let region = full_region(&image, Vector2::new(16.0, 16.0));
        let detection = TemplateMatchDetector.locate(&image, &region, &reference, None);
        assert_eq!(detection.slice, Some(1));
        assert!(detection.position.z.abs() < 1e-12);
    }

    #[test]
    fn test_background_subtraction() {
        let template = blob(16, 16, 8.0, 8.0);
        let reference = ReferenceSet::new(
            vec![template],
            1e-6,
            0,
            Vector2::new(8.0, 8.0),
            Vector2::new(1e-6, 1e-6),
            10e-6,
        )
        .unwrap();

        // strong gradient background that hides the tip
        let gradient = FrameImage::from_fn(40, 40, |x, y| Luma([(x * x + 3 * y * y) as f32]));
        let with_tip = FrameImage::from_fn(40, 40, |x, y| {
            let d2 = (x as f32 - 20.0).powi(2) + (y as f32 - 12.0).powi(2);
            Luma([gradient.get_pixel(x, y)[0] - 50.0 * (-d2 / 8.0).exp() + 2.0 * (x as f32 / 3.0).sin()])
        });
        let image = frame(with_tip, 0.0);
        let background = frame(gradient, 0.0);
        let region = full_region(&image, Vector2::new(20.0, 20.0));

        let detection = TemplateMatchDetector.locate(&image, &region, &reference, Some(&background));
        assert!(detection.confidence > 0.95);
        assert!((detection.position.x - 20e-6).abs() < 0.3e-6);
        assert!((detection.position.y - 12e-6).abs() < 0.3e-6);
    }

    #[test]
    fn test_background_of_wrong_size_is_not_matched() {
        let reference = ReferenceSet::new(
            vec![blob(16, 16, 8.0, 8.0)],
            1e-6,
            0,
            Vector2::new(8.0, 8.0),
            Vector2::new(1e-6, 1e-6),
            10e-6,
        )
        .unwrap();

        let image = frame(blob(40, 40, 20.0, 12.0), 0.0);
        let background = frame(FrameImage::new(20, 20), 0.0);
        let region = full_region(&image, Vector2::new(20.0, 20.0));

        let detection = TemplateMatchDetector.locate(&image, &region, &reference, Some(&background));
        assert_eq!(detection.confidence, 0.0);
        assert!(detection.slice.is_none());
        assert!((detection.position.x - 20e-6).abs() < 1e-9);
    }

    #[test]
    fn test_template_larger_than_crop() {
        let reference = ReferenceSet::new(
            vec![blob(16, 16, 8.0, 8.0)],
            1e-6,
            0,
            Vector2::new(8.0, 8.0),
            Vector2::new(1e-6, 1e-6),
            10e-6,
        )
        .unwrap();
        let image = frame(blob(8, 8, 4.0, 4.0), 0.0);
        let region = full_region(&image, Vector2::new(4.0, 4.0));
        let detection = TemplateMatchDetector.locate(&image, &region, &reference, None);
        assert_eq!(detection.confidence, 0.0);
        assert_eq!(detection.slice, None);
    }

    #[test]
    fn test_confidence_increases_as_noise_decreases() {
        let template = blob(20, 20, 10.0, 10.0);
        let raw = template.as_raw();
        let n = raw.len() as f64;
        let mean = raw.iter().map(|v| *v as f64).sum::<f64>() / n;
        let centered: Vec<f64> = raw.iter().map(|v| *v as f64 - mean).collect();
        let norm2: f64 = centered.iter().map(|v| v * v).sum();

        // zero-mean noise orthogonal to the template
        let mut rng = StdRng::seed_from_u64(11);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut noise: Vec<f64> = (0..raw.len()).map(|_| normal.sample(&mut rng)).collect();
        let noise_mean = noise.iter().sum::<f64>() / n;
        noise.iter_mut().for_each(|v| *v -= noise_mean);
        let projection = noise.iter().zip(&centered).map(|(a, b)| a * b).sum::<f64>() / norm2;
        noise
            .iter_mut()
            .zip(&centered)
            .for_each(|(v, c)| *v -= projection * c);

        let reference = ReferenceSet::new(
            vec![template.clone()],
            1e-6,
            0,
            Vector2::new(10.0, 10.0),
            Vector2::new(1e-6, 1e-6),
            10e-6,
        )
        .unwrap();

        let mut previous = -1.0;
        for sigma in [40.0, 20.0, 10.0, 5.0, 2.0, 0.0] {
            let data: Vec<f32> = raw
                .iter()
                .zip(&noise)
                .map(|(t, e)| (*t as f64 + sigma * e) as f32)
                .collect();
            let image = frame(FrameImage::from_raw(20, 20, data).unwrap(), 0.0);
            let region = full_region(&image, Vector2::new(10.0, 10.0));
            let detection = TemplateMatchDetector.locate(&image, &region, &reference, None);
            assert!(
                detection.confidence >= previous,
                "sigma {}: {} < {}",
                sigma,
                detection.confidence,
                previous
            );
            previous = detection.confidence;
        }
        assert!(previous > 0.999);
    }
}
