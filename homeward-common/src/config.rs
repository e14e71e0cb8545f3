//! Configuration loading and setting resolution
//!
//! Settings resolve in priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! A missing config file is never fatal: a warning is logged and defaults apply.

use crate::time::millis_to_duration;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Tracking engine configuration
///
/// Passed at engine construction; every field has an explicit default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Position poll period
    pub position_poll_interval_ms: u64,
    /// Reference poll period (coarser, the reference changes rarely)
    pub reference_poll_interval_ms: u64,
    /// Position age after which it reads Stale (default: 2 poll periods)
    pub position_stale_after_ms: u64,
    /// Time since last successful resolve after which the reference reads
    /// Stale; None means never
    pub reference_stale_after_ms: Option<u64>,
    /// Delay before the single retry after a transient route failure
    pub route_retry_backoff_ms: u64,
    /// Delay before the single retry after a rate-limited route failure
    pub route_rate_limited_backoff_ms: u64,
    /// Degrees of latitude/longitude movement that count as a material change
    pub route_coordinate_epsilon: f64,
    /// Period of the freshness sweep
    pub freshness_check_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            position_poll_interval_ms: 10_000,
            reference_poll_interval_ms: 300_000,
            position_stale_after_ms: 20_000,
            reference_stale_after_ms: None,
            route_retry_backoff_ms: 5_000,
            route_rate_limited_backoff_ms: 30_000,
            route_coordinate_epsilon: 0.0001,
            freshness_check_interval_ms: 1_000,
        }
    }
}

impl EngineConfig {
    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("position_poll_interval_ms", self.position_poll_interval_ms),
            ("reference_poll_interval_ms", self.reference_poll_interval_ms),
            ("freshness_check_interval_ms", self.freshness_check_interval_ms),
        ];
        for (name, value) in periods {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than 0", name)));
            }
        }

        if self.position_stale_after_ms == 0 {
            return Err(Error::Config(
                "position_stale_after_ms must be greater than 0".to_string(),
            ));
        }

        if !self.route_coordinate_epsilon.is_finite() || self.route_coordinate_epsilon < 0.0 {
            return Err(Error::Config(format!(
                "route_coordinate_epsilon must be a non-negative number, got {}",
                self.route_coordinate_epsilon
            )));
        }

        if self.position_stale_after_ms < self.position_poll_interval_ms {
            warn!(
                stale_after_ms = self.position_stale_after_ms,
                poll_interval_ms = self.position_poll_interval_ms,
                "Position stale threshold is shorter than the poll interval; position will flap to Stale between polls"
            );
        }

        Ok(())
    }

    pub fn position_poll_interval(&self) -> Duration {
        millis_to_duration(self.position_poll_interval_ms)
    }

    pub fn reference_poll_interval(&self) -> Duration {
        millis_to_duration(self.reference_poll_interval_ms)
    }

    pub fn route_retry_backoff(&self) -> Duration {
        millis_to_duration(self.route_retry_backoff_ms)
    }

    pub fn route_rate_limited_backoff(&self) -> Duration {
        millis_to_duration(self.route_rate_limited_backoff_ms)
    }

    pub fn freshness_check_interval(&self) -> Duration {
        millis_to_duration(self.freshness_check_interval_ms)
    }
}

/// Care API connection settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the care API (e.g. `https://care.example.com/api`)
    pub base_url: Option<String>,
    /// Patient whose location is tracked
    pub patient_id: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// Routing provider settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub profile: String,
    pub timeout_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openrouteservice.org".to_string(),
            api_key: None,
            profile: "driving-car".to_string(),
            timeout_ms: 15_000,
        }
    }
}

/// Presentation API server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5790".to_string(),
        }
    }
}

/// Contents of `config.toml`
///
/// Every section is optional; absent keys take their defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub engine: EngineConfig,
    pub api: ApiConfig,
    pub routing: RoutingConfig,
    pub server: ServerConfig,
}

impl TomlConfig {
    /// Load and parse a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TomlConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load the explicit path, else the platform default, else defaults.
    ///
    /// A missing file logs a warning and yields defaults; a file that exists
    /// but does not parse is an error.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path(),
        };

        match path {
            Some(path) if path.exists() => {
                info!("Loading config file: {}", path.display());
                Self::load(&path)
            }
            Some(path) => {
                warn!(
                    "Config file not found at {}; using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            None => {
                warn!("No config file found; using defaults");
                Ok(Self::default())
            }
        }
    }
}

/// Default configuration file path for the platform
///
/// Linux prefers `~/.config/homeward/config.toml`, then
/// `/etc/homeward/config.toml`. Returns None when no candidate exists.
pub fn default_config_path() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("homeward").join("config.toml"));

    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/homeward/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Resolve one setting: CLI argument, then environment variable, then TOML value
///
/// An environment value that fails to parse is ignored with a warning.
pub fn resolve_value<T: FromStr>(
    cli_arg: Option<T>,
    env_var_name: &str,
    toml_value: Option<T>,
) -> Option<T> {
    // Priority 1: Command-line argument
    if cli_arg.is_some() {
        return cli_arg;
    }

    // Priority 2: Environment variable
    if let Ok(raw) = std::env::var(env_var_name) {
        match raw.parse::<T>() {
            Ok(value) => return Some(value),
            Err(_) => warn!("Ignoring unparseable value in {}", env_var_name),
        }
    }

    // Priority 3: TOML config file
    toml_value
}
