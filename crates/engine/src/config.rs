//! Engine configuration management

use anyhow::{Context, Result, anyhow};
use protocol::TransportConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Highest primary address on an IEEE-488 bus
pub const MAX_DEVICE_ADDRESS: u8 = 30;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub timeouts: OperationTimeouts,
    /// Transport used when a work item arrives before any configure
    #[serde(default)]
    pub transport: TransportConfig,
    /// Named-identity lookup table
    ///
    /// # Example Configuration
    /// ```toml
    /// [identities.bench-vna]
    /// kind = "serial-relay"
    /// serial_port = "/dev/ttyUSB0"
    /// device_address = 16
    /// ```
    #[serde(default)]
    pub identities: HashMap<String, TransportConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "EngineSettings::default_log_level")]
    pub log_level: String,
    /// Pause after a device clear before the next item
    #[serde(default = "EngineSettings::default_settle_ms")]
    pub settle_ms: u64,
    /// Debug mode: waits never give up on their own
    #[serde(default)]
    pub disable_timeouts: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            settle_ms: Self::default_settle_ms(),
            disable_timeouts: false,
        }
    }
}

impl EngineSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_settle_ms() -> u64 {
        100
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Upper bounds, in seconds, for the waits of each kind of operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationTimeouts {
    /// Short commands and queries
    #[serde(default = "OperationTimeouts::default_io")]
    pub io_seconds: f64,
    /// Single sweeps
    #[serde(default = "OperationTimeouts::default_sweep")]
    pub sweep_seconds: f64,
    /// Learn string and calibration transfers
    #[serde(default = "OperationTimeouts::default_transfer")]
    pub transfer_seconds: f64,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        Self {
            io_seconds: Self::default_io(),
            sweep_seconds: Self::default_sweep(),
            transfer_seconds: Self::default_transfer(),
        }
    }
}

impl OperationTimeouts {
    fn default_io() -> f64 {
        5.0
    }

    fn default_sweep() -> f64 {
        120.0
    }

    fn default_transfer() -> f64 {
        30.0
    }
}

impl EngineConfig {
    /// Files searched when no path is given, most specific first
    pub fn search_paths() -> [PathBuf; 2] {
        [
            Self::default_path(),
            PathBuf::from("/etc/bench-engine/engine.toml"),
        ]
    }

    /// Load and validate a configuration file
    ///
    /// Without `path` the first existing file of [`Self::search_paths`] is used.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => Self::search_paths()
                .into_iter()
                .find(|candidate| candidate.is_file())
                .ok_or_else(|| anyhow!("no engine.toml in the search path"))?,
        };

        let text = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        let config: EngineConfig =
            toml::from_str(&text).with_context(|| format!("Cannot parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Rejected {}", path.display()))?;

        tracing::info!("Configuration from {}", path.display());
        Ok(config)
    }

    /// [`Self::load`] from the search path, falling back to defaults
    pub fn load_or_default() -> Self {
        Self::load(None).unwrap_or_else(|e| {
            tracing::warn!("{:#}; using built-in defaults", e);
            Self::default()
        })
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("bench-engine").join("engine.toml")
        } else {
            PathBuf::from(".config/bench-engine/engine.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.engine.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.engine.log_level,
                valid_levels.join(", ")
            ));
        }

        for (field, value) in [
            ("io_seconds", self.timeouts.io_seconds),
            ("sweep_seconds", self.timeouts.sweep_seconds),
            ("transfer_seconds", self.timeouts.transfer_seconds),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(anyhow!("Invalid timeouts.{} {}, must be positive", field, value));
            }
        }

        Self::validate_transport("transport", &self.transport)?;
        for (name, identity) in &self.identities {
            if identity.use_named {
                return Err(anyhow!(
                    "Identity '{}' must use explicit addressing",
                    name
                ));
            }
            Self::validate_transport(&format!("identities.{}", name), identity)?;
        }

        Ok(())
    }

    fn validate_transport(section: &str, transport: &TransportConfig) -> Result<()> {
        if transport.device_address > MAX_DEVICE_ADDRESS {
            return Err(anyhow!(
                "Invalid {}.device_address {}, must be 0-{}",
                section,
                transport.device_address,
                MAX_DEVICE_ADDRESS
            ));
        }
        if transport.baud_rate == 0 {
            return Err(anyhow!("Invalid {}.baud_rate 0", section));
        }
        if transport.use_named && transport.name.as_deref().is_none_or(str::is_empty) {
            return Err(anyhow!("{} uses named addressing without a name", section));
        }
        Ok(())
    }
}

/// Load a configuration file, expanding `~`
pub fn load_config(path: &str) -> Result<EngineConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    EngineConfig::load(Some(path_buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::TransportKind;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.engine.log_level, "info");
        assert_eq!(config.engine.settle(), Duration::from_millis(100));
        assert!(!config.engine.disable_timeouts);
        assert_eq!(config.transport.device_address, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = EngineConfig::default();
        let mut relay = TransportConfig::numeric(TransportKind::SerialRelay, 0, 5);
        relay.serial_port = Some("/dev/ttyUSB0".to_string());
        config.identities.insert("bench-vna".to_string(), relay);

        let toml_str = toml::to_string(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.engine.log_level, parsed.engine.log_level);
        assert_eq!(config.timeouts, parsed.timeouts);
        assert_eq!(config.identities, parsed.identities);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: EngineConfig = toml::from_str(
            r#"
            [transport]
            kind = "usb-class"
            controller_index = 1

            [timeouts]
            sweep_seconds = 300.0
            "#,
        )
        .unwrap();

        assert_eq!(parsed.transport.kind, TransportKind::UsbClass);
        assert_eq!(parsed.transport.device_address, 16);
        assert_eq!(parsed.timeouts.sweep_seconds, 300.0);
        assert_eq!(parsed.timeouts.io_seconds, 5.0);
        assert_eq!(parsed.engine.settle_ms, 100);
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = EngineConfig::default();
        assert!(config.validate().is_ok());

        config.engine.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.engine.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_transport() {
        let mut config = EngineConfig::default();
        config.transport.device_address = 31;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.transport.baud_rate = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.transport.use_named = true;
        assert!(config.validate().is_err());
        config.transport.name = Some("hp8753".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_timeouts() {
        let mut config = EngineConfig::default();
        config.timeouts.io_seconds = 0.0;
        assert!(config.validate().is_err());

        config.timeouts.io_seconds = f64::NAN;
        assert!(config.validate().is_err());
    }
}
