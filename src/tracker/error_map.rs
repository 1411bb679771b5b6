//! Grid campaign measuring the pipette positioning error.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nalgebra::{Point3, Vector3};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::controller::{FrameSource, MeasureOptions, PipetteTracker};
use crate::devices::{Cancellation, CenterReference, RestoreGuard, Speed};
use crate::error::{Result, TrackerError};
use crate::imaging::Frame;

/// Campaign parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMapConfig {
    /// Grid points along x, y and z.
    pub n_steps: [usize; 3],
    /// Grid spacing along x, y and z, in metres.
    pub step_size: [f64; 3],
    pub padding: f64,
    pub threshold: f64,
    /// Length of the random detour taken before each grid point.
    pub intermediate_dist: f64,
    pub speed: Speed,
    /// Follow the tip with the stage in x/y, otherwise only refocus.
    pub move_stage_xy: bool,
    /// Pause after the final move before taking a frame.
    pub settle_ms: u64,
    /// Seed for visitation order and detours; random when unset.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ErrorMapConfig {
    fn default() -> Self {
        Self {
            n_steps: [5, 5, 7],
            step_size: [50e-6, 50e-6, 50e-6],
            padding: 60e-6,
            threshold: 0.4,
            intermediate_dist: 60e-6,
            speed: Speed::Slow,
            move_stage_xy: true,
            settle_ms: 200,
            seed: None,
        }
    }
}

impl ErrorMapConfig {
    pub fn with_n_steps(mut self, n_steps: [usize; 3]) -> Self {
        self.n_steps = n_steps;
        self
    }

    pub fn with_step_size(mut self, step_size: [f64; 3]) -> Self {
        self.step_size = step_size;
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

    pub fn with_intermediate_dist(mut self, distance: f64) -> Self {
        self.intermediate_dist = distance;
        self
    }

    pub fn with_speed(mut self, speed: Speed) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_move_stage_xy(mut self, move_stage_xy: bool) -> Self {
        self.move_stage_xy = move_stage_xy;
        self
    }

    pub fn with_settle_ms(mut self, settle_ms: u64) -> Self {
        self.settle_ms = settle_ms;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn point_count(&self) -> usize {
        self.n_steps.iter().product()
    }
}

/// Raw result of an error-mapping campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMapDataset {
    pub id: Uuid,
    pub pipette: String,
    pub started_at: DateTime<Utc>,
    pub n_steps: [usize; 3],
    pub step_size: [f64; 3],
    /// Global tip position at the start of the campaign.
    pub start: [f64; 3],
    /// Measured minus commanded position per grid point, indexed by
    /// [`ErrorMapDataset::flat_index`]. NaN where the tip was not found or
    /// the point was not visited.
    #[serde(with = "nan_as_null")]
    pub errors: Vec<[f64; 3]>,
    /// Grid indices in visitation order.
    pub order: Vec<[usize; 3]>,
    /// Detour offset used before each visited point, in visitation order.
    pub offsets: Vec<[f64; 3]>,
    /// Number of points measured (or attempted) so far.
    pub visited: usize,
    /// Pipette and stage moves that missed their target during the campaign,
    /// excluding the return to the start position.
    pub misses: usize,
    pub duration_secs: f64,
    pub cancelled: bool,
}

mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(values: &[[f64; 3]], serializer: S) -> Result<S::Ok, S::Error> {
        values
            .iter()
            .map(|v| v.map(|x| if x.is_finite() { Some(x) } else { None }))
            .collect::<Vec<[Option<f64>; 3]>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<[f64; 3]>, D::Error> {
        let values = Vec::<[Option<f64>; 3]>::deserialize(deserializer)?;
        Ok(values
            .into_iter()
            .map(|v| v.map(|x| x.unwrap_or(f64::NAN)))
            .collect())
    }
}

impl ErrorMapDataset {
    /// Empty dataset for a campaign starting at `start`.
    pub fn new(pipette: &str, config: &ErrorMapConfig, start: Point3<f64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipette: pipette.to_string(),
            started_at: Utc::now(),
            n_steps: config.n_steps,
            step_size: config.step_size,
            start: [start.x, start.y, start.z],
            errors: vec![[f64::NAN; 3]; config.point_count()],
            order: Vec::with_capacity(config.point_count()),
            offsets: Vec::with_capacity(config.point_count()),
            visited: 0,
            misses: 0,
            duration_secs: 0.0,
            cancelled: false,
        }
    }

    /// Position of grid index `(i, j, k)` in [`ErrorMapDataset::errors`].
    pub fn flat_index(&self, index: [usize; 3]) -> usize {
        (index[0] * self.n_steps[1] + index[1]) * self.n_steps[2] + index[2]
    }

    pub fn error_at(&self, index: [usize; 3]) -> Vector3<f64> {
        Vector3::from(self.errors[self.flat_index(index)])
    }

    /// Commanded global position of a grid index.
    pub fn target(&self, index: [usize; 3]) -> Point3<f64> {
        Point3::new(
            self.start[0] + self.step_size[0] * index[0] as f64,
            self.start[1] + self.step_size[1] * index[1] as f64,
            self.start[2] + self.step_size[2] * index[2] as f64,
        )
    }

    /// Errors of the visited points, in visitation order.
    pub fn errors_in_order(&self) -> Vec<Vector3<f64>> {
        self.order
            .iter()
            .take(self.visited)
            .map(|index| self.error_at(*index))
            .collect()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| TrackerError::Storage(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| TrackerError::Storage(e.to_string()))
    }
}

/// Progress of a running campaign.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMapProgress {
    /// Points measured so far.
    pub visited: usize,
    pub total: usize,
    pub index: [usize; 3],
    /// Measured error, NaN if the tip was not found.
    pub error: Vector3<f64>,
}

/// Every grid index, x slowest and z fastest.
fn grid_indices(n_steps: [usize; 3]) -> Vec<[usize; 3]> {
    let mut indices = Vec::with_capacity(n_steps.iter().product());
    for i in 0..n_steps[0] {
        for j in 0..n_steps[1] {
            for k in 0..n_steps[2] {
                indices.push([i, j, k]);
            }
        }
    }
    indices
}

/// Random direction scaled to `length`.
fn random_offset(rng: &mut StdRng, length: f64) -> Vector3<f64> {
    loop {
        let v: Vector3<f64> = Vector3::new(
            StandardNormal.sample(rng),
            StandardNormal.sample(rng),
            StandardNormal.sample(rng),
        );
        let norm = v.norm();
        if norm > f64::EPSILON {
            return v * (length / norm);
        }
    }
}

/// Runs an error-mapping campaign for one tracker.
///
/// Grid points are visited in random order, each approached from a random
/// direction. The measurement of one point overlaps with the moves towards
/// the next. The pipette and focus are returned to their start positions
/// whether the campaign finishes, fails or is cancelled.
pub struct ErrorMapper<'a> {
    tracker: &'a PipetteTracker,
    config: ErrorMapConfig,
    output: Option<PathBuf>,
    progress: Option<mpsc::UnboundedSender<ErrorMapProgress>>,
}

impl<'a> ErrorMapper<'a> {
    pub fn new(tracker: &'a PipetteTracker, config: ErrorMapConfig) -> Self {
        Self {
            tracker,
            config,
            output: None,
            progress: None,
        }
    }

    /// Save the finished dataset to `path`.
    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<ErrorMapProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    async fn measure(&self, frame: Frame, target: Point3<f64>) -> Vector3<f64> {
        let options = MeasureOptions::default()
            .with_padding(self.config.padding)
            .with_threshold(self.config.threshold)
            .with_frame(FrameSource::Given(frame))
            .with_pos(target);
        match self.tracker.measure_error(&options).await {
            Ok(error) => error,
            Err(e) => {
                tracing::warn!("Could not detect pipette here: {}", e);
                Vector3::repeat(f64::NAN)
            }
        }
    }

    pub async fn run(&self, cancel: &Cancellation) -> Result<ErrorMapDataset> {
        let rig = self.tracker.rig();
        let pipette = rig.pipette.clone();
        let stage = rig.stage.clone();
        let config = &self.config;
        let speed = config.speed;

        let started = Instant::now();
        let start = pipette.global_position();
        let stage_start = stage.global_center_position(CenterReference::Roi);
        let mut dataset = ErrorMapDataset::new(pipette.name(), config, start);

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut order = grid_indices(config.n_steps);
        order.shuffle(&mut rng);
        let total = order.len();
        tracing::info!("Mapping {} errors over {} grid points", pipette.name(), total);

        let restore = {
            let pipette = pipette.clone();
            let stage = stage.clone();
            let move_stage_xy = config.move_stage_xy;
            RestoreGuard::new(move || {
                pipette.move_to_global(start, Speed::Fast);
                if move_stage_xy {
                    let center = Point3::new(stage_start.x, stage_start.y, start.z);
                    stage.move_center_to_global(center, Speed::Fast, CenterReference::Roi);
                } else {
                    stage.set_focus_depth(start.z, Speed::Fast);
                }
            })
        };

        let settle = Duration::from_millis(config.settle_ms);
        let mut pending: Option<([usize; 3], Point3<f64>, Frame)> = None;

        for (i, index) in order.iter().enumerate() {
            tracing::info!("Iteration {}/{}", i + 1, total);
            let target = dataset.target(*index);
            let offset = random_offset(&mut rng, config.intermediate_dist);
            dataset.order.push(*index);
            dataset.offsets.push([offset.x, offset.y, offset.z]);

            let pipette_move = pipette.move_to_global(target + offset, speed);
            let stage_target = if config.move_stage_xy {
                target
            } else {
                let center = stage.global_center_position(CenterReference::Roi);
                Point3::new(center.x, center.y, target.z)
            };
            let stage_move = stage.move_center_to_global(stage_target, speed, CenterReference::Roi);

            if let Some((previous, previous_target, frame)) = pending.take() {
                self.record(&mut dataset, previous, previous_target, frame, total)
                    .await;
            }

            if let Err(e) = pipette_move.wait().await {
                dataset.misses += 1;
                tracing::warn!("Manipulator missed intermediate target: {}", e);
            }
            if let Err(e) = stage_move.wait().await {
                dataset.misses += 1;
                tracing::warn!("Stage missed target: {}", e);
            }
            if let Err(e) = pipette.move_to_global(target, speed).wait().await {
                dataset.misses += 1;
                tracing::warn!("Manipulator missed target: {}", e);
            }

            tokio::time::sleep(settle).await;
            let frame = self.tracker.take_frame().await?;
            pending = Some((*index, target, frame));

            if cancel.is_cancelled() {
                dataset.cancelled = true;
                break;
            }
        }

        // The last captured frame is measured even after a cancel.
        if let Some((previous, previous_target, frame)) = pending.take() {
            self.record(&mut dataset, previous, previous_target, frame, total)
                .await;
        }
        if dataset.cancelled {
            tracing::info!("Error mapping cancelled after {} points", dataset.visited);
        }

        let pipette_home = pipette.move_to_global(start, Speed::Fast);
        let stage_home = if config.move_stage_xy {
            stage.move_center_to_global(
                Point3::new(stage_start.x, stage_start.y, start.z),
                Speed::Fast,
                CenterReference::Roi,
            )
        } else {
            stage.set_focus_depth(start.z, Speed::Fast)
        };
        if let Err(e) = pipette_home.wait().await {
            tracing::warn!("Manipulator did not return to start: {}", e);
        }
        if let Err(e) = stage_home.wait().await {
            tracing::warn!("Stage did not return to start: {}", e);
        }
        restore.disarm();

        dataset.duration_secs = started.elapsed().as_secs_f64();
        tracing::info!("Manipulator missed target {} times", dataset.misses);

        if !dataset.cancelled {
            if let Some(path) = &self.output {
                dataset.save(path)?;
                tracing::info!("Saved error map to {}", path.display());
            }
        }

        Ok(dataset)
    }

    async fn record(
        &self,
        dataset: &mut ErrorMapDataset,
        index: [usize; 3],
        target: Point3<f64>,
        frame: Frame,
        total: usize,
    ) {
        let error = self.measure(frame, target).await;
        let flat = dataset.flat_index(index);
        dataset.errors[flat] = [error.x, error.y, error.z];
        dataset.visited += 1;
        tracing::info!("    error at {:?}: {:?}", index, error);

        if let Some(progress) = &self.progress {
            let _ = progress.send(ErrorMapProgress {
                visited: dataset.visited,
                total,
                index,
                error,
            });
        }
    }
}

impl PipetteTracker {
    /// Run an error-mapping campaign; see [`ErrorMapper`].
    pub async fn map_errors(
        &self,
        config: ErrorMapConfig,
        cancel: &Cancellation,
    ) -> Result<ErrorMapDataset> {
        ErrorMapper::new(self, config).run(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::sim::{SimConfig, SimRig, SimStage};
    use crate::devices::{DeviceError, DeviceFuture, MoveFuture, Rig, Stage};
    use crate::tracker::reference::{ReferenceCaptureOptions, ReferenceLibrary};
    use std::collections::HashSet;
    use std::sync::Arc;

    async fn tracker(sim: &SimRig) -> PipetteTracker {
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

    fn small_grid() -> ErrorMapConfig {
        ErrorMapConfig::default()
            .with_n_steps([2, 2, 1])
            .with_step_size([10e-6, 10e-6, 10e-6])
            .with_padding(20e-6)
            .with_intermediate_dist(15e-6)
            .with_settle_ms(0)
            .with_seed(3)
    }

    #[test]
    fn test_grid_indices_cover_grid() {
        let indices = grid_indices([2, 3, 4]);
        assert_eq!(indices.len(), 24);
        let unique: HashSet<_> = indices.iter().collect();
        assert_eq!(unique.len(), 24);
    }

    #[test]
    fn test_random_offset_length() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..10 {
            let offset = random_offset(&mut rng, 60e-6);
            assert!((offset.norm() - 60e-6).abs() < 1e-12);
        }
    }

    #[test]
    fn test_dataset_json_keeps_nan() {
        let config = ErrorMapConfig::default().with_n_steps([1, 1, 2]);
        let mut dataset = ErrorMapDataset::new("Pipette1", &config, Point3::origin());
        dataset.errors[0] = [1e-6, -2e-6, 0.5e-6];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Pipette1").join("error_map.json");
        dataset.save(&path).unwrap();
        let loaded = ErrorMapDataset::load(&path).unwrap();

        assert_eq!(loaded.errors[0], [1e-6, -2e-6, 0.5e-6]);
        assert!(loaded.errors[1].iter().all(|v| v.is_nan()));
        assert_eq!(loaded.id, dataset.id);
    }

    #[tokio::test]
    async fn test_small_grid_visits_every_point_once() {
        let sim = SimRig::new(SimConfig::default());
        let tracker = tracker(&sim).await;
        let start = tracker.rig().pipette.global_position();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("error_map.json");
        let dataset = ErrorMapper::new(&tracker, small_grid())
            .with_output(&path)
            .run(&Cancellation::new())
            .await
            .unwrap();

        assert_eq!(dataset.visited, 4);
        assert_eq!(dataset.order.len(), 4);
        let unique: HashSet<_> = dataset.order.iter().collect();
        assert_eq!(unique.len(), 4);
        assert_eq!(dataset.offsets.len(), 4);
        assert!(!dataset.cancelled);

        for error in dataset.errors_in_order() {
            assert!(error.iter().all(|v| v.is_nan()) || error.norm() < 2e-6, "{:?}", error);
        }

        assert!((tracker.rig().pipette.global_position() - start).norm() < 1e-9);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_cancelled_campaign_restores_start() {
        let sim = SimRig::new(SimConfig::default());
        let tracker = tracker(&sim).await;
        let start = tracker.rig().pipette.global_position();

        let cancel = Cancellation::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<ErrorMapProgress>();
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                while let Some(progress) = rx.recv().await {
                    if progress.visited >= 2 {
                        cancel.cancel();
                    }
                }
            })
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("error_map.json");
        let dataset = ErrorMapper::new(&tracker, small_grid())
            .with_output(&path)
            .with_progress(tx)
            .run(&cancel)
            .await
            .unwrap();
        watcher.await.unwrap();

        assert!(dataset.cancelled);
        assert!(dataset.visited >= 3 && dataset.visited <= 4);
        // every point moved to was also measured
        assert_eq!(dataset.visited, dataset.order.len());
        for index in &dataset.order {
            let error = dataset.error_at(*index);
            assert!(error.iter().all(|v| v.is_nan()) || error.norm() < 2e-6, "{:?}", error);
        }
        assert!(!path.exists());
        assert!((tracker.rig().pipette.global_position() - start).norm() < 1e-9);
    }

    #[tokio::test]
    async fn test_misses_are_counted() {
        let sim = SimRig::new(SimConfig::default());
        let tracker = tracker(&sim).await;

        // the first detour and the first corrective move both miss
        sim.inject_misses(2);
        let dataset = tracker
            .map_errors(small_grid(), &Cancellation::new())
            .await
            .unwrap();
        assert_eq!(dataset.misses, 2);
        assert_eq!(dataset.visited, 4);
    }

    /// Stage whose xy moves always fail; focus moves work.
    struct StuckStage(Arc<SimStage>);

    impl Stage for StuckStage {
        fn name(&self) -> &str {
            self.0.name()
        }

        fn global_center_position(&self, reference: CenterReference) -> Point3<f64> {
            self.0.global_center_position(reference)
        }

        fn focus_depth(&self) -> f64 {
            self.0.focus_depth()
        }

        fn move_center_to_global(
            &self,
            _pos: Point3<f64>,
            _speed: Speed,
            _reference: CenterReference,
        ) -> MoveFuture {
            DeviceFuture::ready(
                self.name(),
                Err(DeviceError::MoveFailed {
                    device: self.name().to_string(),
                    reason: "stage limit reached".to_string(),
                }),
            )
        }

        fn set_focus_depth(&self, z: f64, speed: Speed) -> MoveFuture {
            self.0.set_focus_depth(z, speed)
        }
    }

    #[tokio::test]
    async fn test_stage_misses_are_counted() {
        let sim = SimRig::new(SimConfig::default());
        let calibrated = tracker(&sim).await;
        let rig = Rig::new(
            sim.camera.clone(),
            sim.pipette.clone(),
            Arc::new(StuckStage(sim.stage.clone())),
        );
        let tracker = PipetteTracker::new(rig, calibrated.library().clone());

        let dataset = tracker
            .map_errors(small_grid(), &Cancellation::new())
            .await
            .unwrap();
        // one failed stage move per point, the return home is not counted
        assert_eq!(dataset.misses, 4);
        assert_eq!(dataset.visited, 4);
    }
}
