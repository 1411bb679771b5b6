//! Focal z-stack acquisition.

use std::time::Duration;

use super::{Cancellation, DeviceError, Imager, Speed, Stage};
use crate::error::{Result, TrackerError};
use crate::imaging::Frame;

/// Focus depths from `start` towards `end` (inclusive) in steps of `step`.
pub fn z_positions(start: f64, end: f64, step: f64) -> Vec<f64> {
    let step = step.abs();
    if step <= 0.0 || !step.is_finite() {
        return vec![start];
    }
    let direction = if end < start { -1.0 } else { 1.0 };
    let count = ((end - start).abs() / step + 1e-6).floor() as usize + 1;
    (0..count)
        .map(|i| start + direction * step * i as f64)
        .collect()
}

/// Acquire one frame at each focus depth of the stack, in order.
///
/// The focus is left at the last depth; callers restore it.
pub async fn run_z_stack(
    imager: &dyn Imager,
    stage: &dyn Stage,
    (start, end, step): (f64, f64, f64),
    frame_timeout: Duration,
    cancel: &Cancellation,
) -> Result<Vec<Frame>> {
    let depths = z_positions(start, end, step);
    let mut frames = Vec::with_capacity(depths.len());

    for (i, z) in depths.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(TrackerError::Cancelled);
        }
        stage.set_focus_depth(*z, Speed::Slow).wait().await?;
        let mut acquired = imager
            .acquire_frames(1)
            .wait_timeout(frame_timeout)
            .await
            .map_err(TrackerError::from_acquisition)?;
        let frame = acquired.pop().ok_or_else(|| {
            TrackerError::Device(DeviceError::Acquisition {
                device: imager.name().to_string(),
                reason: "no frame returned".to_string(),
            })
        })?;
        tracing::debug!("z-stack frame {}/{} at z={:.2e}", i + 1, depths.len(), z);
        frames.push(frame);
    }

    Ok(frames)
}
