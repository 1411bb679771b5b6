//! Zero-mean normalized cross-correlation.

use image::Luma;
use imageproc::definitions::Image;
use imageproc::template_matching::find_extremes;

use super::frame::FrameImage;

/// Correlation peak inside a search image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelationPeak {
    /// Subpixel offset of the template's top-left corner within the search image.
    pub offset: (f64, f64),
    /// Peak correlation, in [-1, 1].
    pub score: f64,
}

/// Zero-mean template with precomputed statistics.
struct PreparedTemplate<'a> {
    template: &'a FrameImage,
    centered: Vec<f64>,
    norm: f64,
}

impl<'a> PreparedTemplate<'a> {
    fn new(template: &'a FrameImage) -> Self {
        let n = template.as_raw().len().max(1) as f64;
        let mean = template.as_raw().iter().map(|v| *v as f64).sum::<f64>() / n;
        let centered: Vec<f64> = template.as_raw().iter().map(|v| *v as f64 - mean).collect();
        let norm = centered.iter().map(|v| v * v).sum::<f64>();
        Self {
            template,
            centered,
            norm,
        }
    }

    fn score_at(&self, image: &FrameImage, x: u32, y: u32) -> f64 {
        let (tw, th) = self.template.dimensions();
        let iw = image.width() as usize;
        let raw = image.as_raw();
        let n = (tw * th) as f64;

        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        let mut cross = 0.0;
        for ty in 0..th as usize {
            let row = (y as usize + ty) * iw + x as usize;
            let trow = ty * tw as usize;
            for tx in 0..tw as usize {
                let v = raw[row + tx] as f64;
                sum += v;
                sum_sq += v * v;
                cross += v * self.centered[trow + tx];
            }
        }

        let variance = sum_sq - sum * sum / n;
        let denom = (variance.max(0.0) * self.norm).sqrt();
        if denom <= f64::EPSILON {
            0.0
        } else {
            cross / denom
        }
    }
}

/// Correlation of `template` against `image` at a single offset.
///
/// Returns `None` if the template does not fit at that offset.
pub fn ncc_at(image: &FrameImage, template: &FrameImage, x: u32, y: u32) -> Option<f64> {
    if x + template.width() > image.width() || y + template.height() > image.height() {
        return None;
    }
    Some(PreparedTemplate::new(template).score_at(image, x, y))
}

/// Correlation map for every offset where `template` fits inside `image`.
pub fn ncc_map(image: &FrameImage, template: &FrameImage) -> Option<Image<Luma<f32>>> {
    let (iw, ih) = image.dimensions();
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 || tw > iw || th > ih {
        return None;
    }

    let prepared = PreparedTemplate::new(template);
    Some(Image::from_fn(iw - tw + 1, ih - th + 1, |x, y| {
        Luma([prepared.score_at(image, x, y) as f32])
    }))
}

/// Best match of `template` inside `image`, refined to subpixel precision.
pub fn best_match(image: &FrameImage, template: &FrameImage) -> Option<CorrelationPeak> {
    let map = ncc_map(image, template)?;
    let extremes = find_extremes(&map);
    let (px, py) = extremes.max_value_location;
    let (dx, dy) = subpixel_offset(&map, px, py);

    Some(CorrelationPeak {
        offset: (px as f64 + dx, py as f64 + dy),
        score: extremes.max_value as f64,
    })
}

/// Parabolic refinement of an integer peak along each axis.
fn subpixel_offset(map: &Image<Luma<f32>>, x: u32, y: u32) -> (f64, f64) {
    let value = |x: u32, y: u32| map.get_pixel(x, y)[0] as f64;
    let center = value(x, y);

    let dx = if x > 0 && x + 1 < map.width() {
        parabola_vertex(value(x - 1, y), center, value(x + 1, y))
    } else {
        0.0
    };
    let dy = if y > 0 && y + 1 < map.height() {
        parabola_vertex(value(x, y - 1), center, value(x, y + 1))
    } else {
        0.0
    };
    (dx, dy)
}

fn parabola_vertex(left: f64, center: f64, right: f64) -> f64 {
    let curvature = left - 2.0 * center + right;
    if curvature >= -f64::EPSILON {
        return 0.0;
    }
    (0.5 * (left - right) / curvature).clamp(-0.5, 0.5)
}
