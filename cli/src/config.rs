// Configuration management for the nmp CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/nearby-multipeer/config.json
// - Linux: ~/.config/nearby-multipeer/config.json
// - Windows: %APPDATA%\nearby-multipeer\config.json

use anyhow::{Context, Result};
use nearby_multipeer_core::transport::DeviceFamily;
use nearby_multipeer_core::{EngineConfig, LogLevel};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Settings for the local engine
    pub engine: EngineConfig,

    /// Display name of the second device in `simulate`
    pub peer_name: String,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig {
                log_level: LogLevel::Warn,
                ..EngineConfig::default()
            },
            peer_name: "loopback-peer".to_string(),
        }
    }
}

impl CliConfig {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("nearby-multipeer");
        Ok(dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load from the platform config file; a missing file means defaults
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: CliConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Set a config value; the config is unchanged if the result is invalid
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut next = self.clone();
        match key {
            "service_id" => next.engine.service_id = value.to_string(),
            "service_uuid" => {
                next.engine.service_uuid = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "display_name" => next.engine.display_name = value.to_string(),
            "peer_name" => next.peer_name = value.to_string(),
            "device_family" => {
                next.engine.device_family = match value.to_ascii_lowercase().as_str() {
                    "android" => DeviceFamily::Android,
                    "ios" => DeviceFamily::Ios,
                    other => anyhow::bail!("Unknown device family: {}", other),
                };
            }
            "command_timeout_ms" => {
                next.engine.command_timeout_ms = value.parse().context("Invalid number")?;
            }
            "connection_timeout_ms" => {
                next.engine.connection_timeout_ms = value.parse().context("Invalid number")?;
            }
            "write_len" => {
                next.engine.write_len = value.parse().context("Invalid number")?;
            }
            "log_level" => {
                let level: u8 = value.parse().context("Invalid log level")?;
                next.engine.log_level = LogLevel::try_from(level)?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        next.engine.validate()?;
        *self = next;
        Ok(())
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let engine = &self.engine;
        vec![
            ("service_id".to_string(), engine.service_id.clone()),
            (
                "service_uuid".to_string(),
                engine
                    .service_uuid
                    .clone()
                    .unwrap_or_else(|| "(default)".to_string()),
            ),
            ("display_name".to_string(), engine.display_name.clone()),
            ("peer_name".to_string(), self.peer_name.clone()),
            ("device_family".to_string(), engine.device_family.to_string()),
            (
                "command_timeout_ms".to_string(),
                engine.command_timeout_ms.to_string(),
            ),
            (
                "connection_timeout_ms".to_string(),
                engine.connection_timeout_ms.to_string(),
            ),
            ("write_len".to_string(), engine.write_len.to_string()),
            ("log_level".to_string(), engine.log_level.to_string()),
        ]
    }
}
