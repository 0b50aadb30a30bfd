//! CLI configuration management

use anyhow::{Context, Result, anyhow};
use common::UsbAddress;
use link::LinkConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// On-disk configuration of the `usb-link` tool
///
/// # Example Configuration
/// ```toml
/// [general]
/// log_level = "info"
/// default_address = "04f9:0042/0x81,0x01,0"
///
/// [link]
/// scratch_capacity = 1048576
/// handshake_timeout_ms = 10000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    pub general: GeneralSettings,
    #[serde(default)]
    pub link: LinkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    #[serde(default = "GeneralSettings::default_log_level")]
    pub log_level: String,
    /// Device used when a subcommand is given no address
    #[serde(default)]
    pub default_address: Option<UsbAddress>,
}

impl GeneralSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            general: GeneralSettings {
                log_level: GeneralSettings::default_log_level(),
                default_address: None,
            },
            link: LinkConfig::default(),
        }
    }
}

impl CliConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-link/config.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: CliConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
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
            config_dir.join("usb-link").join("config.toml")
        } else {
            PathBuf::from(".config/usb-link/config.toml")
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.general.log_level,
                valid_levels.join(", ")
            ));
        }

        self.link.validate().context("Invalid [link] settings")?;

        Ok(())
    }

    /// Resolve the device to use: explicit argument first, then the config
    pub fn address(&self, explicit: Option<UsbAddress>) -> Result<UsbAddress> {
        explicit.or(self.general.default_address).ok_or_else(|| {
            anyhow!("No device address given and no default_address configured")
        })
    }
}
