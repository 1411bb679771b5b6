//! Device collaborators: imager, pipette manipulator and stage/focus.
//!
//! Devices are injected into the tracker as trait objects. Every move or
//! acquisition returns a [`DeviceFuture`] so callers decide when to wait.

mod future;
mod guard;
mod sequencer;
pub mod sim;

use std::sync::Arc;
use std::time::Duration;

use nalgebra::{Affine3, Point3, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::imaging::{ConfigKey, Frame};

pub use future::{Cancellation, DeviceFuture, MoveFuture, ProgressReporter};
pub use guard::RestoreGuard;
pub use sequencer::{run_z_stack, z_positions};

/// Device errors.
#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    #[error("{device} move failed: {reason}")]
    MoveFailed { device: String, reason: String },
    #[error("{device} timed out after {after:?}")]
    Timeout { device: String, after: Duration },
    #[error("{device} operation cancelled")]
    Cancelled { device: String },
    #[error("{device} acquisition failed: {reason}")]
    Acquisition { device: String, reason: String },
    #[error("{device} task failed: {reason}")]
    Task { device: String, reason: String },
    #[error("{device} frame stream closed")]
    StreamClosed { device: String },
}

/// Move speed preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speed {
    Fast,
    #[default]
    Slow,
}

/// Which point of the imager is centered by a stage move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CenterReference {
    #[default]
    Frame,
    Roi,
}

/// Camera or other imaging device.
pub trait Imager: Send + Sync {
    fn name(&self) -> &str;

    /// Acquire `n` frames, each exposed after the call.
    fn acquire_frames(&self, n: usize) -> DeviceFuture<Vec<Frame>>;

    /// Single-slot buffer holding the most recently delivered frame.
    fn subscribe(&self) -> watch::Receiver<Option<Frame>>;

    fn is_running(&self) -> bool;

    /// Start continuous acquisition.
    fn start(&self);

    /// Stop continuous acquisition.
    fn stop(&self);

    /// Identifier of the current optical configuration.
    fn device_state_key(&self) -> ConfigKey;
}

/// Motorized pipette manipulator.
pub trait Pipette: Send + Sync {
    fn name(&self) -> &str;

    /// Tip position in global coordinates, according to the current transform.
    fn global_position(&self) -> Point3<f64>;

    fn yaw_radians(&self) -> f64;

    fn move_to_global(&self, pos: Point3<f64>, speed: Speed) -> MoveFuture;

    /// Move relative to the current position, in the pipette's local frame.
    fn move_to_local(&self, offset: Vector3<f64>, speed: Speed) -> MoveFuture;

    /// Map a global position into the pipette's local frame.
    /// `None` if the transform is not invertible.
    fn map_from_global(&self, pos: &Point3<f64>) -> Option<Point3<f64>> {
        self.transform()
            .try_inverse()
            .map(|inv| inv.transform_point(pos))
    }

    /// Local-to-global transform. Persisted by the device.
    fn transform(&self) -> Affine3<f64>;

    fn set_transform(&self, transform: Affine3<f64>);
}

/// Microscope stage and focus drive.
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Global position currently at the center of `reference`.
    fn global_center_position(&self, reference: CenterReference) -> Point3<f64>;

    fn focus_depth(&self) -> f64;

    /// Move so that `pos` lies at the center of `reference`, in focus.
    fn move_center_to_global(
        &self,
        pos: Point3<f64>,
        speed: Speed,
        reference: CenterReference,
    ) -> MoveFuture;

    fn set_focus_depth(&self, z: f64, speed: Speed) -> MoveFuture;
}

/// The devices one tracker works with.
#[derive(Clone)]
pub struct Rig {
    pub imager: Arc<dyn Imager>,
    pub pipette: Arc<dyn Pipette>,
    pub stage: Arc<dyn Stage>,
}

impl Rig {
    pub fn new(imager: Arc<dyn Imager>, pipette: Arc<dyn Pipette>, stage: Arc<dyn Stage>) -> Self {
        Self {
            imager,
            pipette,
            stage,
        }
    }
}
