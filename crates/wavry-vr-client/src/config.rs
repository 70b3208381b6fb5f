use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wavry_vr::{VrError, VrResult};

use crate::correlation::RETENTION_WINDOW;

pub const DEFAULT_TRACKING_RATE_HZ: u32 = 60;
pub const DEFAULT_MAX_TRACKED_FRAMES: usize = 180;
pub const DEFAULT_IDLE_SLEEP_MS: u64 = 100;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_EYE_HEIGHT_M: f32 = 1.8;

/// Runtime tuning for the headset client.
///
/// Sources are layered: JSON file, then `WAVRY_VR_*` environment variables,
/// then command-line flags applied by the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub app_name: String,
    pub tracking_rate_hz: u32,
    pub retention_window: u64,
    pub max_tracked_frames: usize,
    pub idle_sleep_ms: u64,
    pub handshake_timeout_ms: u64,
    pub eye_height_m: f32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            app_name: "Wavry VR".to_string(),
            tracking_rate_hz: DEFAULT_TRACKING_RATE_HZ,
            retention_window: RETENTION_WINDOW,
            max_tracked_frames: DEFAULT_MAX_TRACKED_FRAMES,
            idle_sleep_ms: DEFAULT_IDLE_SLEEP_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            eye_height_m: DEFAULT_EYE_HEIGHT_M,
        }
    }
}

impl ClientConfig {
    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> VrResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| VrError::Config(format!("read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| VrError::Config(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Applies overrides from `lookup`. Unparseable values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(raw: Option<String>) -> Option<T> {
            raw.and_then(|v| v.trim().parse::<T>().ok())
        }

        if let Some(name) = lookup("WAVRY_VR_APP_NAME").filter(|v| !v.trim().is_empty()) {
            self.app_name = name;
        }
        if let Some(v) = parsed(lookup("WAVRY_VR_TRACKING_RATE_HZ")) {
            self.tracking_rate_hz = v;
        }
        if let Some(v) = parsed(lookup("WAVRY_VR_RETENTION_WINDOW")) {
            self.retention_window = v;
        }
        if let Some(v) = parsed(lookup("WAVRY_VR_MAX_TRACKED_FRAMES")) {
            self.max_tracked_frames = v;
        }
        if let Some(v) = parsed(lookup("WAVRY_VR_IDLE_SLEEP_MS")) {
            self.idle_sleep_ms = v;
        }
        if let Some(v) = parsed(lookup("WAVRY_VR_HANDSHAKE_TIMEOUT_MS")) {
            self.handshake_timeout_ms = v;
        }
        if let Some(v) = parsed(lookup("WAVRY_VR_EYE_HEIGHT_M")) {
            self.eye_height_m = v;
        }
    }

    pub fn validate(&self) -> VrResult<()> {
        if self.tracking_rate_hz == 0 {
            return Err(VrError::Config("tracking_rate_hz must be non-zero".into()));
        }
        if self.idle_sleep_ms == 0 {
            return Err(VrError::Config("idle_sleep_ms must be non-zero".into()));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(VrError::Config("handshake_timeout_ms must be non-zero".into()));
        }
        if self.max_tracked_frames == 0 {
            return Err(VrError::Config("max_tracked_frames must be non-zero".into()));
        }
        if !self.eye_height_m.is_finite() {
            return Err(VrError::Config("eye_height_m must be finite".into()));
        }
        Ok(())
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
