//! Configuration and persisted local profile

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::channel::ParticipantId;

/// Default tolerance band for position corrections (seconds)
pub const DEFAULT_CORRECTION_THRESHOLD_SECONDS: f64 = 0.5;

/// Default host liveness pulse interval (ms)
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5000;

/// Default local re-evaluation tick (ms)
const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;

/// Default delay before skipping a track that failed to play (ms)
const DEFAULT_FAULT_SKIP_DELAY_MS: u64 = 3000;

/// Default media engine API port
pub const DEFAULT_ENGINE_PORT: u16 = 10767;

/// Errors loading or saving configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value: {0}")]
    Invalid(String),
}

/// Tunable sync behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Drift (seconds) above which the transport is re-seeked
    pub correction_threshold_seconds: f64,
    /// Host liveness pulse interval
    pub heartbeat_interval_ms: u64,
    /// Local periodic re-evaluation interval
    pub tick_interval_ms: u64,
    /// Delay before the host skips a track that failed to play
    pub fault_skip_delay_ms: u64,
    /// Origin for relative stream URLs and for the media proxy
    pub server_base_url: String,
    /// Path of the media proxy endpoint on `server_base_url`
    pub proxy_path: String,
    /// Query parameter used to defeat caches on direct sources
    pub cache_bust_param: String,
    /// Marker identifying segmented-stream manifests
    pub segmented_marker: String,
    /// Drop timing messages older than the applied one
    pub reject_stale_snapshots: bool,
    /// Local media engine API port
    pub engine_port: u16,
    /// Status poll interval for the media engine
    pub engine_poll_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            correction_threshold_seconds: DEFAULT_CORRECTION_THRESHOLD_SECONDS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            fault_skip_delay_ms: DEFAULT_FAULT_SKIP_DELAY_MS,
            server_base_url: "http://localhost:8000".to_string(),
            proxy_path: "/api/proxy_media".to_string(),
            cache_bust_param: "t".to_string(),
            segmented_marker: ".m3u8".to_string(),
            reject_stale_snapshots: true,
            engine_port: DEFAULT_ENGINE_PORT,
            engine_poll_interval_ms: 500,
        }
    }
}

impl SyncConfig {
    /// Parse from JSON; missing fields take their defaults
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        debug!("Loaded sync config from {}", path.as_ref().display());
        Self::from_json(&text)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.correction_threshold_seconds.is_finite() && self.correction_threshold_seconds >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "correction_threshold_seconds must be a non-negative number, got {}",
                self.correction_threshold_seconds
            )));
        }
        if self.heartbeat_interval_ms == 0 || self.tick_interval_ms == 0 || self.engine_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("intervals must be non-zero".to_string()));
        }
        if let Err(e) = reqwest::Url::parse(&self.server_base_url) {
            return Err(ConfigError::Invalid(format!("server_base_url: {}", e)));
        }
        if self.cache_bust_param.is_empty() {
            return Err(ConfigError::Invalid("cache_bust_param must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Per-device state persisted between sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalProfile {
    /// Stable participant identifier
    pub participant_id: String,
    /// Last used display name
    #[serde(default)]
    pub display_name: Option<String>,
    /// Last volume level (0.0 to 1.0)
    #[serde(default = "default_volume")]
    pub volume: f32,
}

fn default_volume() -> f32 {
    1.0
}

impl LocalProfile {
    /// Fresh profile with a newly generated participant ID
    pub fn generate() -> Self {
        Self {
            participant_id: ParticipantId::random().to_string(),
            display_name: None,
            volume: default_volume(),
        }
    }

    /// Load from disk, generating (and not yet saving) a new profile if the
    /// file does not exist
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let mut profile: LocalProfile = serde_json::from_str(&text)?;
                profile.volume = profile.volume.clamp(0.0, 1.0);
                Ok(profile)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No profile at {}, generating a new one", path.display());
                Ok(Self::generate())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write to disk
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}
