//! Periodic recalibration of several pipettes for live drift monitoring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nalgebra::Point3;
use tokio::sync::mpsc;
use tokio::time::interval;

use super::controller::{FrameSource, MeasureOptions, PipetteTracker};
use crate::error::Result;

/// Drift monitor configuration.
#[derive(Debug, Clone)]
pub struct DriftMonitorConfig {
    pub interval_ms: u64,
    /// Search padding for each calibration, in metres.
    pub padding: f64,
    pub threshold: f64,
}

impl Default for DriftMonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            padding: 50e-6,
            threshold: 0.6,
        }
    }
}

impl DriftMonitorConfig {
    pub fn with_interval(mut self, ms: u64) -> Self {
        self.interval_ms = ms;
        self
    }

    pub fn with_padding(mut self, padding: f64) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }
}

/// One round of calibrations.
#[derive(Debug, Clone)]
pub struct DriftSample {
    pub time: DateTime<Utc>,
    /// Calibrated global position per tracker, NaN where calibration failed.
    pub positions: Vec<Point3<f64>>,
    /// Distance from the first valid position per tracker, NaN if unknown.
    pub drift: Vec<f64>,
}

/// Handle for stopping a running monitor.
#[derive(Clone)]
pub struct DriftMonitorHandle {
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
}

impl DriftMonitorHandle {
    /// Stop the monitor after the current round.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(()).await;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Repeatedly auto-calibrates a set of trackers from one shared frame.
pub struct DriftMonitor {
    trackers: Vec<Arc<PipetteTracker>>,
    config: DriftMonitorConfig,
    origins: Vec<Option<Point3<f64>>>,
}

impl DriftMonitor {
    pub fn new(trackers: Vec<Arc<PipetteTracker>>, config: DriftMonitorConfig) -> Self {
        let origins = vec![None; trackers.len()];
        Self {
            trackers,
            config,
            origins,
        }
    }

    /// Calibrate every tracker against the latest frame.
    pub async fn sample(&mut self) -> Result<DriftSample> {
        let Some(first) = self.trackers.first() else {
            return Ok(DriftSample {
                time: Utc::now(),
                positions: Vec::new(),
                drift: Vec::new(),
            });
        };
        let frame = first.next_frame().await?;

        let mut positions = Vec::with_capacity(self.trackers.len());
        let mut drift = Vec::with_capacity(self.trackers.len());
        for (tracker, origin) in self.trackers.iter().zip(self.origins.iter_mut()) {
            let options = MeasureOptions::default()
                .with_padding(self.config.padding)
                .with_threshold(self.config.threshold)
                .with_frame(FrameSource::Given(frame.clone()));

            match tracker.auto_calibrate(&options).await {
                Ok(_) => {
                    let pos = tracker.rig().pipette.global_position();
                    let origin = *origin.get_or_insert(pos);
                    positions.push(pos);
                    drift.push((pos - origin).norm());
                }
                Err(e) => {
                    tracing::warn!("Drift sample failed for {}: {}", tracker.pipette_name(), e);
                    positions.push(Point3::new(f64::NAN, f64::NAN, f64::NAN));
                    drift.push(f64::NAN);
                }
            }
        }

        Ok(DriftSample {
            time: frame.acquired_at(),
            positions,
            drift,
        })
    }

    /// Start sampling in the background; samples are sent to `samples`.
    ///
    /// The imager of the first tracker must be streaming.
    pub fn run(mut self, samples: mpsc::Sender<DriftSample>) -> DriftMonitorHandle {
        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let handle = DriftMonitorHandle {
            running: running.clone(),
            stop_tx,
        };

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(self.config.interval_ms));
            loop {
                tokio::select! {
                    biased;

                    _ = stop_rx.recv() => break,

                    _ = ticker.tick() => {
                        match self.sample().await {
                            Ok(sample) => {
                                if samples.send(sample).await.is_err() {
                                    tracing::debug!("Drift sample receiver dropped");
                                    break;
                                }
                            }
                            Err(e) => tracing::error!("Drift monitor could not get a frame: {}", e),
                        }
                    }
                }

                if !running.load(Ordering::SeqCst) {
                    break;
                }
            }

            running.store(false, Ordering::SeqCst);
            tracing::info!("Drift monitor stopped");
        });

        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::sim::{SimConfig, SimRig};
    use crate::devices::{Cancellation, Imager};
    use crate::tracker::reference::{ReferenceCaptureOptions, ReferenceLibrary};

    async fn tracker(sim: &SimRig) -> Arc<PipetteTracker> {
        let tracker = PipetteTracker::new(sim.rig(), Arc::new(ReferenceLibrary::new()));
        let options = ReferenceCaptureOptions::default()
            .with_z_range(10e-6)
            .with_tip_length(30e-6);
        tracker
            .capture_reference(&options, &Cancellation::new())
            .await
            .unwrap();
        Arc::new(tracker)
    }

    #[tokio::test]
    async fn test_sample_tracks_drift() {
        let sim = SimRig::new(SimConfig::default());
        let tracker = tracker(&sim).await;
        sim.camera.start();

        let mut monitor = DriftMonitor::new(
            vec![tracker],
            DriftMonitorConfig::default().with_padding(20e-6),
        );
        let first = monitor.sample().await.unwrap();
        assert_eq!(first.positions.len(), 1);
        assert!(first.drift[0] < 1e-6);

        // the pipette physically drifts by 3 µm
        sim.drift(nalgebra::Vector3::new(3e-6, 0.0, 0.0));
        let second = monitor.sample().await.unwrap();
        assert!((second.drift[0] - 3e-6).abs() < 1e-6, "drift {}", second.drift[0]);
        sim.camera.stop();
    }

    #[tokio::test]
    async fn test_run_and_stop() {
        let sim = SimRig::new(SimConfig::default());
        let tracker = tracker(&sim).await;
        sim.camera.start();

        let (tx, mut rx) = mpsc::channel(4);
        let handle = DriftMonitor::new(
            vec![tracker],
            DriftMonitorConfig::default().with_interval(50).with_padding(20e-6),
        )
        .run(tx);

        let sample = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sample.positions.len(), 1);
        assert!(handle.is_running());

        handle.stop().await;
        // channel closes once the loop exits
        while rx.recv().await.is_some() {}
        assert!(!handle.is_running());
        sim.camera.stop();
    }
}
