//! Error taxonomy shared by the tracking and calibration engine.

use std::time::Duration;

use thiserror::Error;

use crate::devices::DeviceError;
use crate::imaging::{ConfigKey, CropBox};

/// Tracker errors.
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("No reference frames found for this pipette / objective / filter combination: {key}")]
    NoReferenceForConfiguration { key: ConfigKey },
    #[error("No part of tip overlaps with camera frame (clipped box {region})")]
    TipOutOfFrame { region: CropBox },
    #[error(
        "Unable to locate pipette tip (correlation {confidence:.2} < {threshold:.2}) in box {region} for {key}"
    )]
    LocalizationBelowThreshold {
        confidence: f64,
        threshold: f64,
        region: CropBox,
        key: ConfigKey,
    },
    #[error("Did not receive frame from imager within {0:?}")]
    FrameTimeout(Duration),
    #[error("{device} missed target: {reason}")]
    DeviceMoveFailure { device: String, reason: String },
    #[error("Reference capture already in progress for {0}")]
    CaptureInProgress(ConfigKey),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Frame transform is not invertible")]
    SingularTransform,
    #[error("Image size {actual:?} does not match {expected:?}")]
    ImageSizeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("Device error: {0}")]
    Device(DeviceError),
}

impl From<DeviceError> for TrackerError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::MoveFailed { device, reason } => Self::DeviceMoveFailure { device, reason },
            DeviceError::Cancelled { .. } => Self::Cancelled,
            other => Self::Device(other),
        }
    }
}

impl From<std::io::Error> for TrackerError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl TrackerError {
    /// Convert a failed frame acquisition. Timeouts become [`TrackerError::FrameTimeout`].
    pub fn from_acquisition(err: DeviceError) -> Self {
        match err {
            DeviceError::Timeout { after, .. } => Self::FrameTimeout(after),
            other => other.into(),
        }
    }

    /// Whether a retry with a wider search region may succeed.
    pub fn is_below_threshold(&self) -> bool {
        matches!(self, Self::LocalizationBelowThreshold { .. })
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;
