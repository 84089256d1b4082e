//! Hub configuration loading and validation.
//!
//! Every section falls back to its defaults, so an empty TOML document is a
//! valid configuration:
//!
//! ```
//! use sensorhub_core::HubConfig;
//!
//! let config = HubConfig::from_toml_str("[camera]\nmax_total = 4\n").unwrap();
//! assert_eq!(config.camera.max_total, 4);
//! assert_eq!(config.serial.baud_rate, 115_200);
//! ```

use crate::constants::{
    DEFAULT_MIN_LOOP_SLEEP_MS, FRAME_EXPECTED_MIME, NODE_PORT_KEYWORDS, NODE_USB_PIDS, NODE_USB_VID,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub serial: SerialConfig,
    pub nodes: NodeConfig,
    pub camera: CameraConfig,
    pub live: LiveConfig,
}

/// Serial transport parameters for node links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub baud_rate: u32,
    /// Per-read timeout on an open port.
    pub timeout_ms: u64,
    /// Settle delay after opening a port before the handshake starts.
    pub open_delay_ms: u64,
    /// Deadline for receiving a `hello` during the handshake.
    pub handshake_timeout_ms: u64,
    pub usb_vid: u16,
    pub usb_pids: Vec<u16>,
    /// Lowercase keywords matched against port description and hwid.
    pub match_keywords: Vec<String>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            timeout_ms: 1500,
            open_delay_ms: 400,
            handshake_timeout_ms: 4000,
            usb_vid: NODE_USB_VID,
            usb_pids: NODE_USB_PIDS.to_vec(),
            match_keywords: NODE_PORT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn open_delay(&self) -> Duration {
        Duration::from_millis(self.open_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Node discovery and command retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub scan_interval_ms: u64,
    pub retry_attempts: u32,
    pub retry_backoff_base_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 2000,
            retry_attempts: 3,
            retry_backoff_base_ms: 100,
        }
    }
}

impl NodeConfig {
    /// Backoff before retry number `attempt + 1` (`base * 2^attempt`).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_backoff_base_ms.saturating_mul(factor))
    }
}

/// Camera worker executable and admission limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Explicit worker executable; when unset the candidates are probed.
    pub worker_path: Option<PathBuf>,
    pub worker_candidates: Vec<PathBuf>,
    pub max_total: usize,
    pub max_per_device: usize,
    pub scan_interval_ms: u64,
    /// Deadline for a `--list` invocation of the worker.
    pub list_timeout_ms: u64,
    /// Default wait for a single frame in `get_frame`.
    pub frame_timeout_ms: u64,
    /// Grace period between terminate and kill when stopping a worker.
    pub stop_grace_ms: u64,
    pub expected_mime: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            worker_path: None,
            worker_candidates: vec![
                PathBuf::from("worker/bin/Release/camera_worker"),
                PathBuf::from("worker/bin/Debug/camera_worker"),
            ],
            max_total: 6,
            max_per_device: 2,
            scan_interval_ms: 5000,
            list_timeout_ms: 10_000,
            frame_timeout_ms: 2500,
            stop_grace_ms: 1000,
            expected_mime: FRAME_EXPECTED_MIME.to_string(),
        }
    }
}

impl CameraConfig {
    pub fn list_timeout(&self) -> Duration {
        Duration::from_millis(self.list_timeout_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Live broadcast and capture loop cadences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Poll cadence for setups with at least one live subscriber.
    pub poll_interval_ms: u64,
    /// Tick of the background readings capture loop.
    pub capture_tick_ms: u64,
    /// Tick of the background photo capture loop.
    pub photo_tick_ms: u64,
    pub default_value_interval_minutes: f64,
    pub default_photo_interval_minutes: f64,
    pub min_loop_sleep_ms: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            capture_tick_ms: 1000,
            photo_tick_ms: 1000,
            default_value_interval_minutes: 30.0,
            default_photo_interval_minutes: 720.0,
            min_loop_sleep_ms: DEFAULT_MIN_LOOP_SLEEP_MS,
        }
    }
}

impl HubConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Apply the environment overrides honoured by deployed installs.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = lookup("CAMERA_WORKER_PATH").filter(|p| !p.is_empty()) {
            self.camera.worker_path = Some(PathBuf::from(path));
        }
        if let Some(value) = lookup("CAMERA_WORKER_MAX_TOTAL") {
            self.camera.max_total = parse_env("CAMERA_WORKER_MAX_TOTAL", &value)?;
        }
        if let Some(value) = lookup("CAMERA_WORKER_MAX_PER_DEVICE") {
            self.camera.max_per_device = parse_env("CAMERA_WORKER_MAX_PER_DEVICE", &value)?;
        }
        if let Some(value) = lookup("PHOTO_CAPTURE_POLL_INTERVAL_SEC") {
            let secs: f64 = parse_env("PHOTO_CAPTURE_POLL_INTERVAL_SEC", &value)?;
            self.live.photo_tick_ms = (secs * 1000.0) as u64;
        }
        Ok(())
    }

    /// Reject configurations the runtime cannot operate with.
    ///
    /// # Errors
    /// Returns `Error::Config` for zero admission ceilings or a zero retry count.
    pub fn validate(&self) -> Result<()> {
        if self.camera.max_total == 0 {
            return Err(Error::Config("camera.max_total must be at least 1".into()));
        }
        if self.camera.max_per_device == 0 {
            return Err(Error::Config(
                "camera.max_per_device must be at least 1".into(),
            ));
        }
        if self.nodes.retry_attempts == 0 {
            return Err(Error::Config("nodes.retry_attempts must be at least 1".into()));
        }
        if self.serial.baud_rate == 0 {
            return Err(Error::Config("serial.baud_rate must be non-zero".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {key}: {value}")))
}
