// Copyright 2025 ModerRAS
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Pipette Tracker
//!
//! Camera-based tip tracking for motorized micromanipulators.
//!
//! A tracker records a focus stack of the pipette tip as reference, then
//! locates the tip in later frames by template matching. The measured
//! position is used to correct the manipulator's calibration, to map
//! positioning error over a grid of targets, or to monitor drift.
//!
//! ## Auto-calibration Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use pipette_tracker::devices::sim::{SimConfig, SimRig};
//! use pipette_tracker::devices::{Cancellation, Imager};
//! use pipette_tracker::{MeasureOptions, PipetteTracker, ReferenceCaptureOptions, ReferenceLibrary};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let sim = SimRig::new(SimConfig::default());
//!     let tracker = PipetteTracker::new(sim.rig(), Arc::new(ReferenceLibrary::new()));
//!
//!     tracker
//!         .capture_reference(&ReferenceCaptureOptions::default(), &Cancellation::new())
//!         .await?;
//!
//!     sim.camera.start();
//!     let result = tracker.auto_calibrate(&MeasureOptions::default()).await?;
//!     println!("corrected {:?} (confidence {:.2})", result.local_error, result.confidence);
//!     Ok(())
//! }
//! ```
//!
//! ## Error Mapping Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use pipette_tracker::devices::sim::{SimConfig, SimRig};
//! use pipette_tracker::devices::Cancellation;
//! use pipette_tracker::{
//!     ErrorMapAnalysis, ErrorMapConfig, PipetteTracker, ReferenceCaptureOptions, ReferenceLibrary,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let sim = SimRig::new(SimConfig::default());
//!     let tracker = PipetteTracker::new(sim.rig(), Arc::new(ReferenceLibrary::new()));
//!     let cancel = Cancellation::new();
//!     tracker
//!         .capture_reference(&ReferenceCaptureOptions::default(), &cancel)
//!         .await?;
//!
//!     let config = ErrorMapConfig::default().with_n_steps([3, 3, 2]);
//!     let dataset = tracker.map_errors(config, &cancel).await?;
//!     println!("{}", ErrorMapAnalysis::new(&dataset));
//!     Ok(())
//! }
//! ```

pub mod devices;
pub mod error;
pub mod imaging;
pub mod settings;
pub mod tracker;

pub use devices::{
    Cancellation, CenterReference, DeviceError, DeviceFuture, Imager, MoveFuture, Pipette, Rig,
    Speed, Stage,
};
pub use error::{Result, TrackerError};
pub use imaging::{ConfigKey, CropBox, Frame, FrameImage};
pub use settings::TrackerSettings;

pub use tracker::{
    CalibrationResult, Detection, DriftMonitor, DriftMonitorConfig, DriftMonitorHandle,
    DriftSample, ErrorMapAnalysis, ErrorMapConfig, ErrorMapDataset, ErrorMapProgress, ErrorMapper,
    FrameSource, MeasureOptions, PipetteTracker, ReferenceCaptureOptions, ReferenceLibrary,
    ReferenceSet, RetryPolicy, TemplateMatchDetector, TipDetector, TipImageRegion,
    TipMeasurement, TipRegionPlanner,
};
