//! Visual tip tracking, calibration and error mapping.

mod acquire;
pub mod analysis;
mod controller;
pub mod detector;
mod drift;
mod error_map;
mod reference;
pub mod region;
pub mod store;

pub use acquire::{next_frame, take_frame};
pub use analysis::{ErrorMapAnalysis, Histogram};
pub use controller::{
    CalibrationResult, FrameSource, MeasureOptions, PipetteTracker, RetryPolicy, TipMeasurement,
};
pub use detector::{Detection, TemplateMatchDetector, TipDetector};
pub use drift::{DriftMonitor, DriftMonitorConfig, DriftMonitorHandle, DriftSample};
pub use error_map::{ErrorMapConfig, ErrorMapDataset, ErrorMapProgress, ErrorMapper};
pub use reference::{
    capture_reference_stack, CaptureGuard, ReferenceCaptureOptions, ReferenceLibrary, ReferenceSet,
};
pub use region::{suggest_tip_length, TipImageRegion, TipRegionPlanner};
