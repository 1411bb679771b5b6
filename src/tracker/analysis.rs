//! Offline analysis of an error map: drift, error distribution, hysteresis
//! and a linear fit of the manipulator axes.
//!
//! The results are diagnostic; nothing here changes a device transform.

use std::fmt;

use image::Luma;
use imageproc::definitions::Image;
use imageproc::filter::gaussian_blur_f32;
use nalgebra::{DMatrix, Matrix3x4, Vector3};

use super::error_map::ErrorMapDataset;

/// Width of the Gaussian used to estimate slow drift, in samples.
pub const DRIFT_SIGMA: f32 = 20.0;

const HISTOGRAM_BINS: usize = 50;

/// Error magnitude histogram.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    /// Bin edges, one more than `counts`.
    pub edges: Vec<f64>,
    pub counts: Vec<usize>,
}

impl Histogram {
    fn new(values: &[f64], bins: usize) -> Self {
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !min.is_finite() || !max.is_finite() {
            return Self {
                edges: Vec::new(),
                counts: Vec::new(),
            };
        }

        let width = if max > min { (max - min) / bins as f64 } else { 1e-12 };
        let edges = (0..=bins).map(|i| min + width * i as f64).collect();
        let mut counts = vec![0; bins];
        for v in values {
            let bin = (((v - min) / width) as usize).min(bins - 1);
            counts[bin] += 1;
        }
        Self { edges, counts }
    }
}

/// Summary of an [`ErrorMapDataset`].
#[derive(Debug, Clone)]
pub struct ErrorMapAnalysis {
    /// Measured errors of the located points, in visitation order.
    pub errors: Vec<Vector3<f64>>,
    /// `errors` with slow drift removed.
    pub drift_corrected: Vec<Vector3<f64>>,
    /// Magnitudes of `drift_corrected`.
    pub magnitudes: Vec<f64>,
    pub mean_error: f64,
    pub histogram: Histogram,
    /// Per-axis slope of error versus the last approach movement.
    pub hysteresis_slope: Vector3<f64>,
    /// Least-squares affine map from commanded to measured position,
    /// both relative to the campaign start.
    pub axis_transform: Option<Matrix3x4<f64>>,
    /// Visited points where the tip was not found.
    pub missing: usize,
}

impl ErrorMapAnalysis {
    pub fn new(dataset: &ErrorMapDataset) -> Self {
        let mut errors = Vec::new();
        let mut approach = Vec::new();
        let mut commanded = Vec::new();
        let mut missing = 0;

        let start = Vector3::from(dataset.start);
        for (index, offset) in dataset.order.iter().zip(&dataset.offsets).take(dataset.visited) {
            let error = dataset.error_at(*index);
            if error.iter().any(|v| !v.is_finite()) {
                missing += 1;
                continue;
            }
            errors.push(error);
            // the final move to the target runs opposite to the detour
            approach.push(-Vector3::from(*offset));
            commanded.push(dataset.target(*index).coords - start);
        }

        let drift_corrected = subtract_drift(&errors);
        let magnitudes: Vec<f64> = drift_corrected.iter().map(|e| e.norm()).collect();
        let mean_error = if magnitudes.is_empty() {
            f64::NAN
        } else {
            magnitudes.iter().sum::<f64>() / magnitudes.len() as f64
        };
        let histogram = Histogram::new(&magnitudes, HISTOGRAM_BINS);

        let hysteresis_slope = Vector3::from_fn(|axis, _| {
            let x: Vec<f64> = approach.iter().map(|a| a[axis]).collect();
            let y: Vec<f64> = errors.iter().map(|e| e[axis]).collect();
            slope(&x, &y)
        });

        let axis_transform = fit_affine(&commanded, &errors);

        Self {
            errors,
            drift_corrected,
            magnitudes,
            mean_error,
            histogram,
            hysteresis_slope,
            axis_transform,
            missing,
        }
    }
}

impl fmt::Display for ErrorMapAnalysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "points: {} located, {} missing",
            self.errors.len(),
            self.missing
        )?;
        writeln!(f, "mean error (drift removed): {:.3e} m", self.mean_error)?;
        writeln!(
            f,
            "hysteresis slope: x={:.3} y={:.3} z={:.3}",
            self.hysteresis_slope.x, self.hysteresis_slope.y, self.hysteresis_slope.z
        )?;
        match &self.axis_transform {
            Some(m) => write!(f, "axis transform:{}", m),
            None => write!(f, "axis transform: not enough points"),
        }
    }
}

/// Remove the low-frequency component of each axis.
fn subtract_drift(errors: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
    if errors.is_empty() {
        return Vec::new();
    }
    let n = errors.len() as u32;
    let mut drift = vec![Vector3::zeros(); errors.len()];
    for axis in 0..3 {
        // blur in micrometres to stay well within f32 precision
        let series: Image<Luma<f32>> =
            Image::from_fn(n, 1, |x, _| Luma([(errors[x as usize][axis] * 1e6) as f32]));
        let smooth = gaussian_blur_f32(&series, DRIFT_SIGMA);
        for (i, d) in drift.iter_mut().enumerate() {
            d[axis] = smooth.get_pixel(i as u32, 0)[0] as f64 * 1e-6;
        }
    }
    errors.iter().zip(&drift).map(|(e, d)| e - d).collect()
}

/// Least-squares slope of `y` against `x`.
fn slope(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    if x.len() < 2 {
        return f64::NAN;
    }
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let cov: f64 = x.iter().zip(y).map(|(a, b)| (a - mx) * (b - my)).sum();
    let var: f64 = x.iter().map(|a| (a - mx).powi(2)).sum();
    if var <= f64::EPSILON * f64::EPSILON {
        f64::NAN
    } else {
        cov / var
    }
}

/// Fit `measured = A * commanded + b` and return `[A | b]`.
fn fit_affine(commanded: &[Vector3<f64>], errors: &[Vector3<f64>]) -> Option<Matrix3x4<f64>> {
    if commanded.len() < 4 {
        return None;
    }
    let n = commanded.len();
    let x = DMatrix::from_fn(n, 4, |r, c| if c < 3 { commanded[r][c] } else { 1.0 });
    let y = DMatrix::from_fn(n, 3, |r, c| commanded[r][c] + errors[r][c]);

    let solution = x.svd(true, true).solve(&y, 1e-12).ok()?;
    Some(Matrix3x4::from_fn(|r, c| solution[(c, r)]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::error_map::ErrorMapConfig;
    use nalgebra::Point3;

    fn dataset(n_steps: [usize; 3], error: impl Fn([usize; 3], Vector3<f64>) -> Vector3<f64>) -> ErrorMapDataset {
        let config = ErrorMapConfig::default().with_n_steps(n_steps);
        let mut dataset = ErrorMapDataset::new("Pipette1", &config, Point3::new(1e-3, 2e-3, 3e-3));
        let mut k = 0.0;
        for i in 0..n_steps[0] {
            for j in 0..n_steps[1] {
                for l in 0..n_steps[2] {
                    let index = [i, j, l];
                    k += 1.0;
                    let offset = Vector3::new((k * 0.7_f64).sin(), (k * 1.3_f64).cos(), (k * 0.4_f64).sin()) * 60e-6;
                    let e = error(index, offset);
                    let flat = dataset.flat_index(index);
                    dataset.errors[flat] = [e.x, e.y, e.z];
                    dataset.order.push(index);
                    dataset.offsets.push([offset.x, offset.y, offset.z]);
                    dataset.visited += 1;
                }
            }
        }
        dataset
    }

    #[test]
    fn test_constant_offset_is_drift() {
        let data = dataset([3, 3, 2], |_, _| Vector3::new(2e-6, -1e-6, 0.5e-6));
        let analysis = ErrorMapAnalysis::new(&data);
        assert_eq!(analysis.errors.len(), 18);
        assert!(analysis.mean_error < 1e-9);
        assert_eq!(analysis.histogram.counts.iter().sum::<usize>(), 18);
        assert_eq!(analysis.histogram.edges.len(), 51);
    }

    #[test]
    fn test_hysteresis_slope() {
        let data = dataset([3, 3, 3], |_, offset| -offset * 0.1);
        let analysis = ErrorMapAnalysis::new(&data);
        assert!((analysis.hysteresis_slope.x - 0.1).abs() < 1e-9);
        assert!((analysis.hysteresis_slope.y - 0.1).abs() < 1e-9);
        assert!((analysis.hysteresis_slope.z - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_axis_fit_recovers_scale() {
        let step = 50e-6;
        let data = dataset([3, 3, 3], |index, _| {
            let commanded = Vector3::new(index[0] as f64, index[1] as f64, index[2] as f64) * step;
            commanded * 0.01 + Vector3::new(1e-6, 0.0, 0.0)
        });
        let analysis = ErrorMapAnalysis::new(&data);
        let m = analysis.axis_transform.unwrap();
        for r in 0..3 {
            for c in 0..3 {
                let expected = if r == c { 1.01 } else { 0.0 };
                assert!((m[(r, c)] - expected).abs() < 1e-6, "{}", m);
            }
        }
        assert!((m[(0, 3)] - 1e-6).abs() < 1e-10);
    }

    #[test]
    fn test_missing_points_are_skipped() {
        let data = dataset([2, 2, 1], |index, _| {
            if index == [1, 0, 0] {
                Vector3::repeat(f64::NAN)
            } else {
                Vector3::new(1e-6, 1e-6, 1e-6)
            }
        });
        let analysis = ErrorMapAnalysis::new(&data);
        assert_eq!(analysis.missing, 1);
        assert_eq!(analysis.errors.len(), 3);
        assert!(analysis.axis_transform.is_none());
        assert!(analysis.mean_error.is_finite());
    }
}
