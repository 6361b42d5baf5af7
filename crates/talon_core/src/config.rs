//! Runtime configuration.
//!
//! Every field has a default, so a missing config file is never an error.
//!
//! ## File Locations
//! `load()` probes, in order:
//! 1. `./talon.toml`, `./talon.json`
//! 2. `<platform config dir>/talon/talon.toml`, then `.json`
//!
//! ## Environment Variables
//! Applied on top of whatever the file provided:
//! - `TALON_REQUEST_TIMEOUT_SECS`, `TALON_CONNECT_TIMEOUT_SECS`
//! - `TALON_MAX_ATTEMPTS`, `TALON_BASE_BACKOFF_MS`
//! - `TALON_EVENT_PATH`, `TALON_HEARTBEAT_SECS`
//! - `TALON_MAX_RECONNECT_ATTEMPTS`, `TALON_RECONNECT_BASE_MS`
//! - `TALON_BRIDGE_EXECUTABLE`, `TALON_BRIDGE_CONFIG`

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TalonError};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TalonConfig {
    /// Request dispatcher settings
    pub dispatcher: DispatcherConfig,
    /// Event stream settings
    pub stream: StreamConfig,
    /// Subprocess bridge settings
    pub bridge: BridgeConfig,
}

/// Request dispatcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Total time allowed for one request, body included
    pub request_timeout_secs: u64,
    /// Time allowed for connection setup
    pub connect_timeout_secs: u64,
    /// Total attempts per call, first attempt included
    pub max_attempts: u32,
    /// Backoff base; attempt `n` waits `base * 2^n`
    pub base_backoff_ms: u64,
    /// User-Agent header
    pub user_agent: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            max_attempts: 3,
            base_backoff_ms: 1000,
            user_agent: format!("talon/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl DispatcherConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }
}

/// Event stream settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Path of the push-event endpoint on the server
    pub event_path: String,
    /// Ping interval
    pub heartbeat_interval_secs: u64,
    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Reconnect base; attempt `n` waits `base * 2^(n-1)`
    pub reconnect_base_ms: u64,
    /// Size of the recent-activity ring buffer
    pub recent_activity_capacity: usize,
    /// Capacity of each broadcast channel
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            event_path: "/api/v1/events".to_string(),
            heartbeat_interval_secs: 30,
            max_reconnect_attempts: 5,
            reconnect_base_ms: 2000,
            recent_activity_capacity: 50,
            channel_capacity: 256,
        }
    }
}

impl StreamConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }
}

/// Subprocess bridge settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Executable name or path
    pub executable: PathBuf,
    /// Client config passed as `--config`
    pub config_path: Option<PathBuf>,
    /// Maximum stderr bytes kept for error reporting
    pub stderr_limit_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("velociraptor"),
            config_path: None,
            stderr_limit_bytes: 64 * 1024,
        }
    }
}

impl TalonConfig {
    /// Load from the first config file found, then apply environment overrides.
    ///
    /// Falls back to defaults when no file exists.
    pub fn load() -> Result<Self> {
        let mut config = match probe_config_paths() {
            Some(path) => Self::load_from_file(&path)?,
            None => {
                tracing::debug!("No config file found, using defaults");
                Self::default()
            }
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Load from a specific TOML or JSON file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration from file");

        let contents = std::fs::read_to_string(path).map_err(|e| {
            TalonError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config = parse_config(&contents, path)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TALON_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = &mut self.dispatcher;
        override_parsed(&lookup, "TALON_REQUEST_TIMEOUT_SECS", &mut d.request_timeout_secs)?;
        override_parsed(&lookup, "TALON_CONNECT_TIMEOUT_SECS", &mut d.connect_timeout_secs)?;
        override_parsed(&lookup, "TALON_MAX_ATTEMPTS", &mut d.max_attempts)?;
        override_parsed(&lookup, "TALON_BASE_BACKOFF_MS", &mut d.base_backoff_ms)?;

        let s = &mut self.stream;
        if let Some(path) = lookup("TALON_EVENT_PATH") {
            s.event_path = path;
        }
        override_parsed(&lookup, "TALON_HEARTBEAT_SECS", &mut s.heartbeat_interval_secs)?;
        override_parsed(&lookup, "TALON_MAX_RECONNECT_ATTEMPTS", &mut s.max_reconnect_attempts)?;
        override_parsed(&lookup, "TALON_RECONNECT_BASE_MS", &mut s.reconnect_base_ms)?;

        if let Some(exe) = lookup("TALON_BRIDGE_EXECUTABLE") {
            self.bridge.executable = PathBuf::from(exe);
        }
        if let Some(path) = lookup("TALON_BRIDGE_CONFIG") {
            self.bridge.config_path = Some(PathBuf::from(path));
        }

        self.validate()
    }

    /// Reject values that would make a component unusable.
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.max_attempts == 0 {
            return Err(TalonError::config("dispatcher.max_attempts must be at least 1"));
        }
        if self.dispatcher.request_timeout_secs == 0 {
            return Err(TalonError::config("dispatcher.request_timeout_secs must be positive"));
        }
        if self.stream.heartbeat_interval_secs == 0 {
            return Err(TalonError::config("stream.heartbeat_interval_secs must be positive"));
        }
        if self.stream.max_reconnect_attempts == 0 {
            return Err(TalonError::config("stream.max_reconnect_attempts must be at least 1"));
        }
        if self.stream.recent_activity_capacity == 0 || self.stream.channel_capacity == 0 {
            return Err(TalonError::config("stream capacities must be positive"));
        }
        if !self.stream.event_path.starts_with('/') {
            return Err(TalonError::config("stream.event_path must start with '/'"));
        }
        Ok(())
    }
}

fn override_parsed<T, F>(lookup: &F, key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| TalonError::config(format!("Invalid value for {key}: {e}")))?;
    }
    Ok(())
}

fn parse_config(contents: &str, path: &Path) -> Result<TalonConfig> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match extension {
        "toml" => toml::from_str(contents)
            .map_err(|e| TalonError::config(format!("Invalid TOML format: {}", e))),
        "json" => serde_json::from_str(contents)
            .map_err(|e| TalonError::config(format!("Invalid JSON format: {}", e))),
        _ => Err(TalonError::config(format!("Unsupported config format: {}", extension))),
    }
}

/// First existing config file among the standard locations.
pub fn probe_config_paths() -> Option<PathBuf> {
    let mut candidates = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join("talon.toml"));
        candidates.push(cwd.join("talon.json"));
    }
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("talon").join("talon.toml"));
        candidates.push(dir.join("talon").join("talon.json"));
    }

    candidates.into_iter().find(|p| p.is_file())
}

/// Directory for logs and the development credentials file.
pub fn default_data_dir() -> PathBuf {
    #[cfg(debug_assertions)]
    {
        PathBuf::from("./talon_data")
    }

    #[cfg(not(debug_assertions))]
    {
        dirs::data_dir().map(|d| d.join("talon")).unwrap_or_else(|| PathBuf::from("./talon_data"))
    }
}
