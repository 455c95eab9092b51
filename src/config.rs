//! Runtime settings for the signage player.
//!
//! Loaded from an optional `signage.toml` next to the binary, with
//! `SIGNAGE_`-prefixed environment variables layered on top.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Download tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    /// Number of downloads in flight at once. 1 means strictly sequential.
    pub concurrency: usize,
    /// Per-attempt timeout for image downloads.
    pub image_timeout_secs: u64,
    /// Per-attempt timeout for video downloads. Capped at five minutes so a
    /// stalled host cannot wedge a sync cycle.
    pub video_timeout_secs: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            image_timeout_secs: 30,
            video_timeout_secs: 300,
        }
    }
}

/// Top-level player settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Google Sheet base URL the manifest is read from.
    pub manifest_url: String,
    /// Apps Script endpoint view logs are posted to.
    pub log_sink_url: String,
    /// Device/screen identifier. Falls back to the persisted one when unset.
    pub device_id: Option<String>,
    /// Directory for durable player state (device id, persisted playlist).
    pub data_dir: PathBuf,
    /// Directory for cached media files.
    pub cache_dir: PathBuf,
    /// Cache size ceiling in gigabytes.
    pub max_cache_gb: u64,
    /// How long an image stays on screen.
    pub image_duration_ms: u64,
    /// Duration of each fade phase (out and in).
    pub transition_ms: u64,
    /// Manifest refresh interval.
    pub refresh_interval_secs: u64,
    /// Videos shorter than this loop seamlessly inside their display window
    /// instead of cutting off at end of stream.
    pub video_loop_threshold_secs: f32,
    /// Smallest plausible size for a real video file. Anything below this is
    /// treated as a download error page.
    pub video_min_bytes: u64,
    pub download: DownloadSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            manifest_url: String::new(),
            log_sink_url: String::new(),
            device_id: None,
            data_dir: PathBuf::from("data"),
            cache_dir: PathBuf::from("cache"),
            max_cache_gb: 8,
            image_duration_ms: 3000,
            transition_ms: 300,
            refresh_interval_secs: 60,
            video_loop_threshold_secs: 10.0,
            video_min_bytes: 64 * 1024,
            download: DownloadSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from `signage.toml` (if present) and the environment.
    pub fn load() -> Result<Self> {
        let defaults = config::Config::try_from(&Settings::default())
            .context("Failed to build default settings")?;

        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::with_name("signage").required(false))
            .add_source(config::Environment::with_prefix("SIGNAGE").separator("__"))
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        Ok(settings)
    }

    pub fn image_duration(&self) -> Duration {
        Duration::from_millis(self.image_duration_ms)
    }

    pub fn transition_duration(&self) -> Duration {
        Duration::from_millis(self.transition_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}
