pub mod fleet_config;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::config::fleet_config::FleetConfig;
use crate::utils::write_file_atomically;

const APP_DIR_NAME: &str = "sensor-fleet";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// One of error, warn, info, debug, trace
    pub level: String,
    /// Also append log lines to `sensor-fleet.log` in the config directory
    pub file_logging_enabled: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_logging_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub fleet: FleetConfig,
    pub logging: LogConfig,
}

/// Directory holding the config, the fleet snapshot and the log file.
pub fn app_config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir().ok_or_else(|| anyhow!("No config directory on this platform"))?;
    Ok(base.join(APP_DIR_NAME))
}

impl AppConfig {
    /// Loads the config from `dir`, falling back to defaults when absent.
    pub async fn load_config(dir: &Path) -> Result<Self> {
        let file_path = dir.join(CONFIG_FILE_NAME);

        if !file_path.exists() {
            warn!("Config file not found at {:?}, using default.", file_path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(&file_path)
            .await
            .with_context(|| format!("reading {:?}", file_path))?;
        let config: Self = serde_json::from_str(&config_json)
            .with_context(|| format!("parsing {:?}", file_path))?;

        info!("Config loaded from {:?}", file_path);
        Ok(config)
    }

    /// Saves the current config into `dir`.
    pub async fn save_config(&self, dir: &Path) -> Result<()> {
        let file_path = dir.join(CONFIG_FILE_NAME);

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize config to JSON: {}", e);
                return Err(e.into());
            }
        };

        write_file_atomically(&file_path, config_json.as_bytes()).await?;

        info!("Config saved to {:?}.", file_path);
        Ok(())
    }
}
