//! Persisted tracker settings.
//! Stored in the platform-specific config directory via `directories::ProjectDirs`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::tracker::{
    DriftMonitorConfig, ErrorMapConfig, MeasureOptions, ReferenceCaptureOptions, RetryPolicy,
};

/// Tracker settings that can be saved and loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    /// Pipette device name, used for per-pipette storage
    pub pipette: String,
    /// Frame wait timeout in milliseconds
    pub frame_timeout_ms: u64,
    /// Reference stack focus range in metres
    pub reference_z_range: f64,
    /// Reference stack focus step in metres
    pub reference_z_step: f64,
    /// Reference tip length in metres (0 = 100 pixels)
    pub reference_tip_length: f64,
    /// Measurement padding in metres
    pub measure_padding: f64,
    /// Minimum correlation for a measurement
    pub measure_threshold: f64,
    /// Calibration retries and padding growth
    pub retry: RetryPolicy,
    /// Error map campaign parameters
    pub error_map: ErrorMapConfig,
    /// Drift monitor interval in milliseconds
    pub drift_interval_ms: u64,
    /// Drift monitor padding in metres
    pub drift_padding: f64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            pipette: "Pipette1".to_string(),
            frame_timeout_ms: 5000,
            reference_z_range: 80e-6,
            reference_z_step: 1e-6,
            reference_tip_length: 0.0,
            measure_padding: 50e-6,
            measure_threshold: 0.6,
            retry: RetryPolicy::default(),
            error_map: ErrorMapConfig::default(),
            drift_interval_ms: 2000,
            drift_padding: 50e-6,
        }
    }
}

impl TrackerSettings {
    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("org", "pipette-tracker", "pipette-tracker")
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the data directory path.
    pub fn data_dir() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Get the settings file path.
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("settings.json"))
    }

    /// Reference store of the configured pipette.
    pub fn reference_store_path(&self) -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join(&self.pipette).join("ref_frames.bin"))
    }

    /// Error map output of the configured pipette.
    pub fn error_map_path(&self) -> Option<PathBuf> {
        Self::data_dir().map(|dir| dir.join(&self.pipette).join("error_map.json"))
    }

    /// Load settings from the config file.
    pub fn load() -> Self {
        let loaded: Self = Self::settings_path()
            .and_then(|path| fs::read_to_string(&path).ok())
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        loaded.backfilled()
    }

    /// Replace empty or zero fields with defaults.
    pub fn backfilled(mut self) -> Self {
        let defaults = Self::default();
        if self.pipette.is_empty() {
            self.pipette = defaults.pipette;
        }
        if self.frame_timeout_ms == 0 {
            self.frame_timeout_ms = defaults.frame_timeout_ms;
        }
        if self.reference_z_range <= 0.0 {
            self.reference_z_range = defaults.reference_z_range;
        }
        if self.reference_z_step <= 0.0 {
            self.reference_z_step = defaults.reference_z_step;
        }
        if self.measure_padding <= 0.0 {
            self.measure_padding = defaults.measure_padding;
        }
        if self.drift_interval_ms == 0 {
            self.drift_interval_ms = defaults.drift_interval_ms;
        }
        if self.drift_padding <= 0.0 {
            self.drift_padding = defaults.drift_padding;
        }
        self
    }

    /// Save settings to the config file.
    pub fn save(&self) -> Result<(), String> {
        let dir = Self::config_dir().ok_or("Cannot determine config directory")?;

        fs::create_dir_all(&dir)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;

        let path = dir.join("settings.json");
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        fs::write(&path, content)
            .map_err(|e| format!("Failed to write settings file: {}", e))?;

        Ok(())
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn reference_options(&self) -> ReferenceCaptureOptions {
        let options = ReferenceCaptureOptions::default()
            .with_z_range(self.reference_z_range)
            .with_z_step(self.reference_z_step)
            .with_frame_timeout(self.frame_timeout());
        if self.reference_tip_length > 0.0 {
            options.with_tip_length(self.reference_tip_length)
        } else {
            options
        }
    }

    pub fn measure_options(&self) -> MeasureOptions {
        MeasureOptions::default()
            .with_padding(self.measure_padding)
            .with_threshold(self.measure_threshold)
    }

    pub fn drift_config(&self) -> DriftMonitorConfig {
        DriftMonitorConfig::default()
            .with_interval(self.drift_interval_ms)
            .with_padding(self.drift_padding)
            .with_threshold(self.measure_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backfill_zero_fields() {
        let settings = TrackerSettings {
            pipette: String::new(),
            frame_timeout_ms: 0,
            reference_z_step: 0.0,
            ..TrackerSettings::default()
        }
        .backfilled();
        assert_eq!(settings, TrackerSettings::default());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: TrackerSettings =
            serde_json::from_str(r#"{"pipette": "Pipette2", "measure_threshold": 0.75}"#).unwrap();
        assert_eq!(settings.pipette, "Pipette2");
        assert_eq!(settings.measure_threshold, 0.75);
        assert_eq!(settings.error_map, ErrorMapConfig::default());
    }

    #[test]
    fn test_storage_paths_are_per_pipette() {
        let settings = TrackerSettings {
            pipette: "Pipette2".to_string(),
            ..TrackerSettings::default()
        };
        if let Some(path) = settings.reference_store_path() {
            assert!(path.ends_with("Pipette2/ref_frames.bin"));
        }
        if let Some(path) = settings.error_map_path() {
            assert!(path.ends_with("Pipette2/error_map.json"));
        }
    }

    #[test]
    fn test_options_follow_settings() {
        let settings = TrackerSettings {
            reference_tip_length: 30e-6,
            measure_padding: 20e-6,
            ..TrackerSettings::default()
        };
        assert_eq!(settings.reference_options().tip_length, Some(30e-6));
        assert_eq!(settings.measure_options().padding, Some(20e-6));
        assert_eq!(TrackerSettings::default().reference_options().tip_length, None);
    }
}
