//! Frame acquisition helpers shared by the tracker operations.

use std::time::Duration;

use crate::devices::{DeviceError, Imager};
use crate::error::{Result, TrackerError};
use crate::imaging::Frame;

/// Acquire a frame that was exposed after this call.
///
/// A streaming imager is stopped for the acquisition and restarted afterwards.
pub async fn take_frame(imager: &dyn Imager, timeout: Duration) -> Result<Frame> {
    let restart = imager.is_running();
    if restart {
        imager.stop();
    }
    let result = imager.acquire_frames(1).wait_timeout(timeout).await;
    if restart {
        imager.start();
    }

    result
        .map_err(TrackerError::from_acquisition)?
        .pop()
        .ok_or_else(|| {
            TrackerError::Device(DeviceError::Acquisition {
                device: imager.name().to_string(),
                reason: "no frame returned".to_string(),
            })
        })
}

/// Wait for the next frame delivered by a streaming imager.
pub async fn next_frame(imager: &dyn Imager, timeout: Duration) -> Result<Frame> {
    let mut frames = imager.subscribe();
    let device = imager.name().to_string();

    let wait = async {
        loop {
            frames
                .changed()
                .await
                .map_err(|_| DeviceError::StreamClosed {
                    device: device.clone(),
                })?;
            let latest = frames.borrow_and_update().clone();
            if let Some(frame) = latest {
                return Ok::<Frame, TrackerError>(frame);
            }
        }
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| TrackerError::FrameTimeout(timeout))?
}
