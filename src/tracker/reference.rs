//! Reference z-stacks of the tip, keyed by optical configuration.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use nalgebra::{Vector2, Vector3};

use super::acquire::take_frame;
use super::region::{suggest_tip_length, TipRegionPlanner};
use super::store;
use crate::devices::{run_z_stack, Cancellation, RestoreGuard, Rig, Speed};
use crate::error::{Result, TrackerError};
use crate::imaging::{crop_image, ncc_at, subtract, ConfigKey, FrameImage};

/// Background-subtracted images of the tip over a range of focus depths.
#[derive(Debug, Clone)]
pub struct ReferenceSet {
    /// Template crops, ordered from the highest to the lowest focus depth.
    pub frames: Vec<FrameImage>,
    /// Focus distance between consecutive frames, in metres.
    pub z_step: f64,
    /// Index of the frame in which the tip is in focus.
    pub center_index: usize,
    /// Subpixel tip location within each template.
    pub center_pos: Vector2<f64>,
    pub pixel_size: Vector2<f64>,
    pub tip_length: f64,
}

impl ReferenceSet {
    /// Validates that the stack is non-empty, that all templates share one
    /// size and that `center_index` lies within the stack.
    pub fn new(
        frames: Vec<FrameImage>,
        z_step: f64,
        center_index: usize,
        center_pos: Vector2<f64>,
        pixel_size: Vector2<f64>,
        tip_length: f64,
    ) -> Result<Self> {
        let first = frames
            .first()
            .ok_or_else(|| TrackerError::Storage("reference set has no frames".to_string()))?;
        if frames.iter().any(|f| f.dimensions() != first.dimensions()) {
            return Err(TrackerError::Storage(
                "reference frames differ in size".to_string(),
            ));
        }
        if center_index >= frames.len() {
            return Err(TrackerError::Storage(format!(
                "center index {} outside of {} reference frames",
                center_index,
                frames.len()
            )));
        }

        Ok(Self {
            frames,
            z_step,
            center_index,
            center_pos,
            pixel_size,
            tip_length,
        })
    }

    /// Template width and height in pixels.
    pub fn template_size(&self) -> (u32, u32) {
        self.frames.first().map(|f| f.dimensions()).unwrap_or((0, 0))
    }

    /// Tip depth relative to the focal plane for the frame at `index`.
    pub fn relative_depth(&self, index: usize) -> f64 {
        (index as f64 - self.center_index as f64) * self.z_step
    }
}

/// Options for capturing a reference stack.
#[derive(Debug, Clone)]
pub struct ReferenceCaptureOptions {
    /// Total focus range covered by the stack, in metres.
    pub z_range: f64,
    pub z_step: f64,
    /// Imaged tip length; defaults to 100 pixels.
    pub tip_length: Option<f64>,
    pub frame_timeout: Duration,
}

impl Default for ReferenceCaptureOptions {
    fn default() -> Self {
        Self {
            z_range: 80e-6,
            z_step: 1e-6,
            tip_length: None,
            frame_timeout: Duration::from_secs(5),
        }
    }
}

impl ReferenceCaptureOptions {
    pub fn with_z_range(mut self, z_range: f64) -> Self {
        self.z_range = z_range;
        self
    }

    pub fn with_z_step(mut self, z_step: f64) -> Self {
        self.z_step = z_step;
        self
    }

    pub fn with_tip_length(mut self, tip_length: f64) -> Self {
        self.tip_length = Some(tip_length);
        self
    }

    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }
}

/// Reference sets of one pipette.
///
/// Reads are concurrent. Captures are exclusive per configuration key.
#[derive(Debug, Default)]
pub struct ReferenceLibrary {
    sets: RwLock<HashMap<ConfigKey, Arc<ReferenceSet>>>,
    capturing: Mutex<HashSet<ConfigKey>>,
    path: Option<PathBuf>,
}

/// Exclusive right to capture a reference for one key; released on drop.
#[derive(Debug)]
pub struct CaptureGuard<'a> {
    library: &'a ReferenceLibrary,
    key: ConfigKey,
}

impl CaptureGuard<'_> {
    pub fn key(&self) -> &ConfigKey {
        &self.key
    }
}

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        self.library
            .capturing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

impl ReferenceLibrary {
    /// In-memory library.
    pub fn new() -> Self {
        Self::default()
    }

    /// Library backed by the store at `path`, loading existing entries.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let sets = store::load(&path)?
            .into_iter()
            .map(|(key, set)| (key, Arc::new(set)))
            .collect::<HashMap<_, _>>();
        tracing::debug!("Loaded {} reference sets from {}", sets.len(), path.display());

        Ok(Self {
            sets: RwLock::new(sets),
            capturing: Mutex::new(HashSet::new()),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Reference set for `key`.
    pub fn lookup(&self, key: &ConfigKey) -> Result<Arc<ReferenceSet>> {
        self.sets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
            .ok_or_else(|| TrackerError::NoReferenceForConfiguration { key: key.clone() })
    }

    pub fn contains(&self, key: &ConfigKey) -> bool {
        self.sets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    pub fn keys(&self) -> Vec<ConfigKey> {
        let mut keys: Vec<_> = self
            .sets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Insert or replace the set for `key` and persist the library.
    pub fn store(&self, key: ConfigKey, set: ReferenceSet) -> Result<Arc<ReferenceSet>> {
        let set = Arc::new(set);
        self.sets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, set.clone());
        self.persist()?;
        Ok(set)
    }

    /// Write all sets to the backing store, if any.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let sets = self.sets.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<_> = sets.iter().map(|(k, v)| (k, v.as_ref())).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        store::save(path, entries)?;
        tracing::debug!("Saved {} reference sets to {}", sets.len(), path.display());
        Ok(())
    }

    /// Claim the capture slot for `key`.
    pub fn begin_capture(&self, key: &ConfigKey) -> Result<CaptureGuard<'_>> {
        let mut capturing = self.capturing.lock().unwrap_or_else(|e| e.into_inner());
        if !capturing.insert(key.clone()) {
            return Err(TrackerError::CaptureInProgress(key.clone()));
        }
        Ok(CaptureGuard {
            library: self,
            key: key.clone(),
        })
    }
}

/// Capture a reference z-stack for the imager's current configuration.
///
/// The tip must be in focus near the frame center with a valid calibration.
/// A foreground stack is acquired around the tip depth, the pipette is
/// retracted by three tip lengths along its local x axis and a background
/// stack is acquired over the same depths. Pipette position and focus are
/// restored afterwards, also on failure or cancellation.
pub async fn capture_reference_stack(
    rig: &Rig,
    library: &ReferenceLibrary,
    options: &ReferenceCaptureOptions,
    cancel: &Cancellation,
) -> Result<Arc<ReferenceSet>> {
    let key = rig.imager.device_state_key();
    let _capture = library.begin_capture(&key)?;
    tracing::info!("Capturing reference frames for {}", key);

    let center_frame = take_frame(rig.imager.as_ref(), options.frame_timeout).await?;
    let tip_length = options
        .tip_length
        .unwrap_or_else(|| suggest_tip_length(&center_frame));
    let tip = rig.pipette.global_position();
    let region = TipRegionPlanner::new(tip_length * 0.15, rig.pipette.yaw_radians())
        .with_tip_length(tip_length)
        .plan(&center_frame, &tip)?;
    let center = center_frame.crop(&region.bounds);

    let z_start = tip.z + options.z_range / 2.0;
    let z_end = tip.z - options.z_range / 2.0;
    let stack = (z_start, z_end, options.z_step);

    let focus = rig.stage.focus_depth();
    let restore = {
        let pipette = rig.pipette.clone();
        let stage = rig.stage.clone();
        RestoreGuard::new(move || {
            pipette.move_to_global(tip, Speed::Fast);
            stage.set_focus_depth(focus, Speed::Fast);
        })
    };

    let frames = run_z_stack(
        rig.imager.as_ref(),
        rig.stage.as_ref(),
        stack,
        options.frame_timeout,
        cancel,
    )
    .await?;

    let retract = Vector3::new(-tip_length * 3.0, 0.0, 0.0);
    rig.pipette.move_to_local(retract, Speed::Slow).wait().await?;
    let backgrounds = run_z_stack(
        rig.imager.as_ref(),
        rig.stage.as_ref(),
        stack,
        options.frame_timeout,
        cancel,
    )
    .await?;
    rig.pipette.move_to_local(-retract, Speed::Slow).wait().await?;
    rig.stage.set_focus_depth(focus, Speed::Slow).wait().await?;
    restore.disarm();

    if frames.len() != backgrounds.len() {
        return Err(TrackerError::Storage(format!(
            "foreground and background stacks differ in length ({} != {})",
            frames.len(),
            backgrounds.len()
        )));
    }

    let center_index = frames
        .iter()
        .enumerate()
        .filter_map(|(i, f)| ncc_at(&f.crop(&region.bounds), &center, 0, 0).map(|score| (i, score)))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
        .unwrap_or(frames.len() / 2);

    let templates = frames
        .iter()
        .zip(&backgrounds)
        .map(|(fg, bg)| Ok(crop_image(&subtract(fg.data(), bg.data())?, &region.bounds)))
        .collect::<Result<Vec<_>>>()?;

    let set = ReferenceSet::new(
        templates,
        options.z_step.abs(),
        center_index,
        region.tip_rel_pos,
        center_frame.pixel_size(),
        tip_length,
    )?;
    tracing::info!(
        "Captured {} reference frames for {} (best focus at index {})",
        set.frames.len(),
        key,
        center_index
    );

    library.store(key, set)
}
