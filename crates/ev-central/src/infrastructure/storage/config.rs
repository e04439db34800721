//! TOML-based configuration for the coordinator process.
//!
//! The file location comes from `--config` / `EV_CENTRAL_CONFIG`.  A missing
//! file is not an error: every field has a default, so the coordinator runs
//! out of the box and older files keep working when fields are added.
//!
//! ```toml
//! [network]
//! bind_address = "0.0.0.0"
//! line_port = 9000
//! framed_port = 9099
//!
//! [protocol]
//! ack_timeout_ms = 5000
//! idle_timeout_secs = 300
//!
//! [pricing]
//! default_price_per_kwh = 0.35
//! default_max_power = 11.0
//!
//! [storage]
//! path = "data/central_db.json"
//! enabled = true
//!
//! [central]
//! log_level = "info"
//! session_history = 64
//! console = true
//! ```
//!
//! # Serde default values
//!
//! Fields annotated with `#[serde(default = "some_fn")]` use the return value
//! of `some_fn()` when the field is absent.  Whole sections may be omitted
//! too (`#[serde(default)]` on the section).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::coordinator::CoordinatorSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CentralConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub central: ProcessConfig,
}

/// Listening sockets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// IP address both listeners bind to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port of the newline-delimited JSON transport.
    #[serde(default = "default_line_port")]
    pub line_port: u16,
    /// Port of the STX/ETX framed transport.
    #[serde(default = "default_framed_port")]
    pub framed_port: u16,
}

/// Framed-transport timers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolConfig {
    /// How long a sender waits for ACK/NACK.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Silence after which a framed peer is considered gone.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

/// Tariff applied to charging points that register without one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PricingConfig {
    #[serde(default = "default_price_per_kwh")]
    pub default_price_per_kwh: f64,
    #[serde(default = "default_max_power")]
    pub default_max_power: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// JSON file holding charging-point records.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    /// `false` keeps records in memory only.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessConfig {
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Ended sessions kept for the operator console.
    #[serde(default = "default_session_history")]
    pub session_history: usize,
    /// Read operator commands from stdin.
    #[serde(default = "default_true")]
    pub console: bool,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_line_port() -> u16 {
    9000
}
fn default_framed_port() -> u16 {
    9099
}
fn default_ack_timeout_ms() -> u64 {
    5000
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_price_per_kwh() -> f64 {
    0.35
}
fn default_max_power() -> f64 {
    11.0
}
fn default_storage_path() -> PathBuf {
    PathBuf::from("data/central_db.json")
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_session_history() -> usize {
    64
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            line_port: default_line_port(),
            framed_port: default_framed_port(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            default_price_per_kwh: default_price_per_kwh(),
            default_max_power: default_max_power(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            enabled: default_true(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            session_history: default_session_history(),
            console: default_true(),
        }
    }
}

impl ProtocolConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl CentralConfig {
    /// The subset the coordinator itself consumes.
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            default_price_per_kwh: self.pricing.default_price_per_kwh,
            default_max_power: self.pricing.default_max_power,
            session_history: self.central.session_history,
        }
    }
}

// ── Load / save ───────────────────────────────────────────────────────────────

/// Loads the configuration at `path`, returning defaults if the file does
/// not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<CentralConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CentralConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &CentralConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
