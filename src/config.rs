//! Driver configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `RSN_DRIVER_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use rsn_platform_driver::config::DriverConfig;
//!
//! let config = DriverConfig::load_from("config/driver.toml")?;
//! println!("Node: {}", config.driver.node_id);
//! # Ok::<(), rsn_platform_driver::error::PlatformError>(())
//! ```

use crate::error::{PlatformError, PlatformResult};
use crate::error_recovery::RetryPolicy;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// OMS driver settings
    pub driver: DriverSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Settings consumed by [`PlatformDriver::configure`](crate::platform::PlatformDriver::configure).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSettings {
    /// Platform identity of this node in the OMS namespace
    pub node_id: String,
    /// URI of the OMS RPC endpoint (`sim://` selects the in-process simulator)
    #[serde(default)]
    pub oms_uri: String,
    /// Path to the YAML node configuration file
    pub node_cfg_file: PathBuf,
    /// URL registered with the OMS for event notifications, if any
    #[serde(default)]
    pub listener_url: Option<String>,
    /// Reconnection policy after a lost connection
    #[serde(default)]
    pub reconnect: RetryPolicy,
}

fn default_name() -> String {
    "rsn-platform-driver".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DriverConfig {
    /// Load configuration from a specific file path merged with the environment
    ///
    /// Environment variables override file values, e.g.
    /// `RSN_DRIVER_DRIVER__OMS_URI=sim://local`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> PlatformResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RSN_DRIVER_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> PlatformResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(PlatformError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.driver.oms_uri.trim().is_empty() {
            tracing::error!(config = ?self.driver, "'oms_uri' not present in driver config");
            return Err(PlatformError::Configuration(
                "driver config does not indicate 'oms_uri'".to_string(),
            ));
        }

        if self.driver.node_id.trim().is_empty() {
            return Err(PlatformError::Configuration(
                "driver config does not indicate 'node_id'".to_string(),
            ));
        }

        Ok(())
    }
}
