//! Tip measurement and automatic calibration of one pipette.

use std::sync::Arc;
use std::time::Duration;

use nalgebra::{Point3, Translation3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use super::acquire::{next_frame, take_frame};
use super::detector::{TemplateMatchDetector, TipDetector};
use super::reference::{capture_reference_stack, ReferenceCaptureOptions, ReferenceLibrary, ReferenceSet};
use super::region::{TipImageRegion, TipRegionPlanner};
use crate::devices::{Cancellation, RestoreGuard, Rig, Speed};
use crate::error::{Result, TrackerError};
use crate::imaging::{ConfigKey, Frame, FrameImage};

/// Where a measurement gets its frame from.
#[derive(Debug, Clone, Default)]
pub enum FrameSource {
    /// Acquire a new frame, exposed after the call.
    #[default]
    Acquire,
    /// Wait for the next frame of a streaming imager.
    Next,
    /// Use a frame the caller already has.
    Given(Frame),
}

/// Options for a single tip measurement.
#[derive(Debug, Clone)]
pub struct MeasureOptions {
    /// Search padding around the tip, in metres. Defaults to 50 µm for
    /// measurements and to the reference tip length for calibration.
    pub padding: Option<f64>,
    /// Minimum accepted correlation.
    pub threshold: f64,
    /// Frame to search. Defaults to [`FrameSource::Acquire`] for
    /// measurements and [`FrameSource::Next`] for calibration.
    pub frame: Option<FrameSource>,
    /// Expected global tip position. Defaults to the pipette's reported position.
    pub pos: Option<Point3<f64>>,
    /// Imaged tip length. Defaults to the reference tip length.
    pub tip_length: Option<f64>,
    /// Retract the pipette to acquire a background frame.
    pub move_pipette: bool,
}

impl Default for MeasureOptions {
    fn default() -> Self {
        Self {
            padding: None,
            threshold: 0.6,
            frame: None,
            pos: None,
            tip_length: None,
            move_pipette: false,
        }
    }
}

impl MeasureOptions {
    /// Defaults used when measuring position errors.
    pub fn for_error() -> Self {
        Self {
            threshold: 0.7,
            ..Self::default()
        }
    }

    pub fn with_padding(mut self, padding: f64) -> Self {
        self.padding = Some(padding);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_frame(mut self, frame: FrameSource) -> Self {
        self.frame = Some(frame);
        self
    }

    pub fn with_pos(mut self, pos: Point3<f64>) -> Self {
        self.pos = Some(pos);
        self
    }

    pub fn with_tip_length(mut self, tip_length: f64) -> Self {
        self.tip_length = Some(tip_length);
        self
    }

    pub fn with_move_pipette(mut self, move_pipette: bool) -> Self {
        self.move_pipette = move_pipette;
        self
    }
}

/// Retries after a below-threshold localization, each with a wider search region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub padding_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            padding_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_padding_multiplier(mut self, multiplier: f64) -> Self {
        self.padding_multiplier = multiplier;
        self
    }
}

/// A located tip.
#[derive(Debug, Clone)]
pub struct TipMeasurement {
    /// Measured global tip position.
    pub position: Point3<f64>,
    /// Global position the search was centered on.
    pub expected: Point3<f64>,
    pub confidence: f64,
    pub region: TipImageRegion,
    pub key: ConfigKey,
}

impl TipMeasurement {
    /// Measured minus expected position.
    pub fn error(&self) -> Vector3<f64> {
        self.position - self.expected
    }
}

/// Correction applied by [`PipetteTracker::auto_calibrate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationResult {
    /// Offset applied to the pipette transform, in pipette-local coordinates.
    pub local_error: Vector3<f64>,
    pub confidence: f64,
}

/// Visual tip tracker for one pipette.
pub struct PipetteTracker {
    rig: Rig,
    library: Arc<ReferenceLibrary>,
    detector: Arc<dyn TipDetector>,
    retry: RetryPolicy,
    frame_timeout: Duration,
}

impl PipetteTracker {
    pub fn new(rig: Rig, library: Arc<ReferenceLibrary>) -> Self {
        Self {
            rig,
            library,
            detector: Arc::new(TemplateMatchDetector),
            retry: RetryPolicy::default(),
            frame_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn TipDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    pub fn rig(&self) -> &Rig {
        &self.rig
    }

    pub fn library(&self) -> &Arc<ReferenceLibrary> {
        &self.library
    }

    pub fn pipette_name(&self) -> &str {
        self.rig.pipette.name()
    }

    pub fn frame_timeout(&self) -> Duration {
        self.frame_timeout
    }

    /// Reference set for the imager's current configuration.
    pub fn reference(&self) -> Result<Arc<ReferenceSet>> {
        self.library.lookup(&self.rig.imager.device_state_key())
    }

    /// Acquire a frame exposed after this call.
    pub async fn take_frame(&self) -> Result<Frame> {
        take_frame(self.rig.imager.as_ref(), self.frame_timeout).await
    }

    /// Wait for the next streamed frame.
    pub async fn next_frame(&self) -> Result<Frame> {
        next_frame(self.rig.imager.as_ref(), self.frame_timeout).await
    }

    async fn resolve_frame(&self, source: FrameSource) -> Result<Frame> {
        match source {
            FrameSource::Acquire => self.take_frame().await,
            FrameSource::Next => self.next_frame().await,
            FrameSource::Given(frame) => Ok(frame),
        }
    }

    /// Image around the reported tip position, with the subpixel tip location
    /// inside it.
    pub async fn take_tip_image(&self, padding: f64) -> Result<(FrameImage, Vector2<f64>)> {
        let frame = self.take_frame().await?;
        let region = TipRegionPlanner::new(padding, self.rig.pipette.yaw_radians())
            .plan(&frame, &self.rig.pipette.global_position())?;
        Ok((frame.crop(&region.bounds), region.tip_rel_pos))
    }

    /// Capture and store a reference stack for the current configuration.
    pub async fn capture_reference(
        &self,
        options: &ReferenceCaptureOptions,
        cancel: &Cancellation,
    ) -> Result<Arc<ReferenceSet>> {
        let options = ReferenceCaptureOptions {
            frame_timeout: self.frame_timeout,
            ..options.clone()
        };
        capture_reference_stack(&self.rig, &self.library, &options, cancel).await
    }

    /// Retract the pipette, take a frame and move back to where it was.
    async fn take_background_frame(&self, tip_length: f64) -> Result<Frame> {
        let pipette = self.rig.pipette.clone();
        let home = pipette.global_position();
        let restore = {
            let pipette = pipette.clone();
            RestoreGuard::new(move || {
                pipette.move_to_global(home, Speed::Fast);
            })
        };

        pipette
            .move_to_local(Vector3::new(-tip_length * 3.0, 0.0, 0.0), Speed::Fast)
            .wait()
            .await?;
        let background = self.take_frame().await?;
        pipette.move_to_global(home, Speed::Fast).wait().await?;
        restore.disarm();
        Ok(background)
    }

    /// Locate the tip by template matching around its expected position.
    ///
    /// Fails with [`TrackerError::LocalizationBelowThreshold`] if the match
    /// is weaker than `options.threshold`.
    pub async fn measure_tip_position(&self, options: &MeasureOptions) -> Result<TipMeasurement> {
        let frame = self
            .resolve_frame(options.frame.clone().unwrap_or_default())
            .await?;

        let key = self.rig.imager.device_state_key();
        let reference = self.library.lookup(&key)?;
        let tip_length = options.tip_length.unwrap_or(reference.tip_length);
        let padding = options.padding.unwrap_or(50e-6);
        let expected = options
            .pos
            .unwrap_or_else(|| self.rig.pipette.global_position());

        let background = if options.move_pipette {
            Some(self.take_background_frame(tip_length).await?)
        } else {
            None
        };

        let region = TipRegionPlanner::new(padding, self.rig.pipette.yaw_radians())
            .with_tip_length(tip_length)
            .plan(&frame, &expected)?;

        let detection = self
            .detector
            .locate(&frame, &region, &reference, background.as_ref());

        if detection.confidence < options.threshold {
            return Err(TrackerError::LocalizationBelowThreshold {
                confidence: detection.confidence,
                threshold: options.threshold,
                region: region.bounds,
                key,
            });
        }

        Ok(TipMeasurement {
            position: detection.position,
            expected,
            confidence: detection.confidence,
            region,
            key,
        })
    }

    /// Error vector from the expected to the measured tip position.
    /// Does not change the calibration.
    pub async fn measure_error(&self, options: &MeasureOptions) -> Result<Vector3<f64>> {
        Ok(self.measure_tip_position(options).await?.error())
    }

    /// Locate the tip and shift the pipette transform so the reported
    /// position matches the measured one.
    ///
    /// Below-threshold localizations are retried with a wider search region
    /// according to the retry policy.
    pub async fn auto_calibrate(&self, options: &MeasureOptions) -> Result<CalibrationResult> {
        let reference = self.reference()?;
        let mut attempt = options.clone();
        attempt.padding = Some(options.padding.unwrap_or(reference.tip_length));
        attempt.frame = Some(options.frame.clone().unwrap_or(FrameSource::Next));

        let mut retries = 0;
        let measurement = loop {
            match self.measure_tip_position(&attempt).await {
                Ok(measurement) => break measurement,
                Err(e) if e.is_below_threshold() && retries < self.retry.max_retries => {
                    retries += 1;
                    let padding = attempt.padding.unwrap_or(reference.tip_length)
                        * self.retry.padding_multiplier;
                    tracing::warn!("{}; retrying with padding {:.1e} m", e, padding);
                    attempt.padding = Some(padding);
                }
                Err(e) => return Err(e),
            }
        };

        let pipette = &self.rig.pipette;
        let measured = pipette
            .map_from_global(&measurement.position)
            .ok_or(TrackerError::SingularTransform)?;
        let expected = pipette
            .map_from_global(&measurement.expected)
            .ok_or(TrackerError::SingularTransform)?;
        let local_error = measured - expected;
        let transform = pipette.transform() * Translation3::from(local_error);
        pipette.set_transform(transform);

        tracing::info!(
            "{} calibrated: local error {:?} (correlation {:.2})",
            pipette.name(),
            local_error,
            measurement.confidence
        );

        Ok(CalibrationResult {
            local_error,
            confidence: measurement.confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::sim::{SimConfig, SimRig};
    use crate::tracker::detector::Detection;
    use nalgebra::{Affine3, Matrix4};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDetector {
        inner: TemplateMatchDetector,
        calls: AtomicUsize,
    }

    impl TipDetector for CountingDetector {
        fn locate(
            &self,
            frame: &Frame,
            region: &TipImageRegion,
            reference: &ReferenceSet,
            background: Option<&Frame>,
        ) -> Detection {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.locate(frame, region, reference, background)
        }
    }

    async fn calibrated_tracker(sim: &SimRig) -> PipetteTracker {
        let tracker = PipetteTracker::new(sim.rig(), Arc::new(ReferenceLibrary::new()));
        let options = ReferenceCaptureOptions::default()
            .with_z_range(10e-6)
            .with_tip_length(30e-6);
        tracker
            .capture_reference(&options, &Cancellation::new())
            .await
            .unwrap();
        tracker
    }

    fn acquire() -> MeasureOptions {
        MeasureOptions::default().with_frame(FrameSource::Acquire)
    }

    #[tokio::test]
    async fn test_measure_without_reference() {
        let sim = SimRig::new(SimConfig::default());
        let tracker = PipetteTracker::new(sim.rig(), Arc::new(ReferenceLibrary::new()));
        let result = tracker.measure_tip_position(&acquire()).await;
        assert!(matches!(
            result,
            Err(TrackerError::NoReferenceForConfiguration { .. })
        ));
    }

    #[tokio::test]
    async fn test_measure_tip_position() {
        let sim = SimRig::new(SimConfig::default());
        let tracker = calibrated_tracker(&sim).await;

        let measurement = tracker
            .measure_tip_position(&acquire().with_padding(20e-6))
            .await
            .unwrap();
        assert!(measurement.confidence > 0.8);
        assert!((measurement.position - sim.true_tip_position()).norm() < 1e-6);
    }

    #[tokio::test]
    async fn test_measure_with_background_frame() {
        let sim = SimRig::new(SimConfig::default());
        let tracker = calibrated_tracker(&sim).await;

        let measurement = tracker
            .measure_tip_position(&acquire().with_padding(20e-6).with_move_pipette(true))
            .await
            .unwrap();
        assert!(measurement.confidence > 0.8);
        assert!((measurement.position - sim.true_tip_position()).norm() < 1e-6);
        // pipette is back at its measured position
        assert!(sim.true_tip_position().coords.norm() < 1e-9);
    }

    #[tokio::test]
    async fn test_background_frame_returns_to_actual_position() {
        let sim = SimRig::new(SimConfig::default());
        let tracker = calibrated_tracker(&sim).await;
        let before = sim.true_tip_position();

        // search centered away from where the pipette really is
        let options = acquire()
            .with_padding(20e-6)
            .with_pos(Point3::new(5e-6, 3e-6, 0.0))
            .with_move_pipette(true);
        let measurement = tracker.measure_tip_position(&options).await.unwrap();

        assert!((measurement.position - before).norm() < 1e-6);
        assert!((sim.true_tip_position() - before).norm() < 1e-9);
    }

    #[tokio::test]
    async fn test_auto_calibrate_corrects_offset() {
        let sim = SimRig::new(SimConfig::default());
        let tracker = calibrated_tracker(&sim).await;

        sim.miscalibrate(Vector3::new(3e-6, -2e-6, 0.0));
        let reported = tracker.rig().pipette.global_position();
        assert!((reported - sim.true_tip_position()).norm() > 3e-6);

        let result = tracker.auto_calibrate(&acquire()).await.unwrap();
        assert_eq!(sim.transform_updates(), 1);
        assert!((result.local_error - Vector3::new(3e-6, -2e-6, 0.0)).norm() < 1e-6);

        let corrected = tracker.rig().pipette.global_position();
        assert!((corrected - sim.true_tip_position()).norm() < 1e-6);
    }

    #[tokio::test]
    async fn test_singular_transform_is_not_applied() {
        let sim = SimRig::new(SimConfig::default());
        let tracker = calibrated_tracker(&sim).await;

        // flattens z, so positions still resolve but cannot be mapped back
        let flat = Affine3::from_matrix_unchecked(Matrix4::new(
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ));
        tracker.rig().pipette.set_transform(flat);

        let result = tracker.auto_calibrate(&acquire()).await;
        assert!(matches!(result, Err(TrackerError::SingularTransform)));
        assert_eq!(sim.transform_updates(), 1);
        assert_eq!(tracker.rig().pipette.transform(), flat);
    }

    #[tokio::test]
    async fn test_failed_calibration_leaves_transform() {
        let sim = SimRig::new(SimConfig::default());
        let tracker = calibrated_tracker(&sim).await;

        let result = tracker.auto_calibrate(&acquire().with_threshold(1.1)).await;
        match result {
            Err(TrackerError::LocalizationBelowThreshold {
                confidence,
                threshold,
                ..
            }) => {
                assert!(confidence <= 1.0);
                assert_eq!(threshold, 1.1);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(sim.transform_updates(), 0);
    }

    #[tokio::test]
    async fn test_retry_doubles_padding_once() {
        let sim = SimRig::new(SimConfig::default());
        let detector = Arc::new(CountingDetector {
            inner: TemplateMatchDetector,
            calls: AtomicUsize::new(0),
        });
        let tracker = calibrated_tracker(&sim).await.with_detector(detector.clone());

        let result = tracker.auto_calibrate(&acquire().with_threshold(1.1)).await;
        assert!(result.is_err());
        assert_eq!(detector.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_configurable_retry_count() {
        let sim = SimRig::new(SimConfig::default());
        let detector = Arc::new(CountingDetector {
            inner: TemplateMatchDetector,
            calls: AtomicUsize::new(0),
        });
        let tracker = calibrated_tracker(&sim)
            .await
            .with_detector(detector.clone())
            .with_retry_policy(RetryPolicy::default().with_max_retries(0));

        let result = tracker.auto_calibrate(&acquire().with_threshold(1.1)).await;
        assert!(result.is_err());
        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tip_out_of_frame_is_not_retried() {
        let sim = SimRig::new(SimConfig::default());
        let tracker = calibrated_tracker(&sim).await;

        let options = acquire().with_pos(Point3::new(1e-3, 1e-3, 0.0));
        let result = tracker.auto_calibrate(&options).await;
        assert!(matches!(result, Err(TrackerError::TipOutOfFrame { .. })));
        assert_eq!(sim.transform_updates(), 0);
    }

    #[tokio::test]
    async fn test_measure_error_reports_offset() {
        let sim = SimRig::new(SimConfig::default());
        let tracker = calibrated_tracker(&sim).await;
        sim.miscalibrate(Vector3::new(-4e-6, 1e-6, 0.0));

        let error = tracker
            .measure_error(&MeasureOptions::for_error().with_frame(FrameSource::Acquire).with_padding(20e-6))
            .await
            .unwrap();
        assert!((error - Vector3::new(-4e-6, 1e-6, 0.0)).norm() < 1e-6);
        assert_eq!(sim.transform_updates(), 0);
    }

    #[tokio::test]
    async fn test_take_tip_image() {
        let sim = SimRig::new(SimConfig::default());
        let tracker = PipetteTracker::new(sim.rig(), Arc::new(ReferenceLibrary::new()));
        let (image, tip) = tracker.take_tip_image(5e-6).await.unwrap();
        assert!(image.width() > 0 && image.height() > 0);
        assert!(tip.x >= 0.0 && tip.x <= image.width() as f64);
        assert!(tip.y >= 0.0 && tip.y <= image.height() as f64);
    }
}
