// Extension Host Config Engine
// Loads and saves the runtime configuration.
// The configuration is stored as a JSON file at the platform-specific config path.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::types::config::{default_config_dir, RuntimeConfig};
use crate::types::errors::ConfigError;

pub const CONFIG_FILE: &str = "config.json";

/// Trait defining the config engine interface.
pub trait ConfigEngineTrait {
    fn load(&mut self) -> Result<RuntimeConfig, ConfigError>;
    fn save(&self) -> Result<(), ConfigError>;
    fn get(&self) -> &RuntimeConfig;
    fn set(&mut self, config: RuntimeConfig);
    fn config_path(&self) -> &Path;
}

/// Config engine that persists the runtime configuration as JSON on disk.
pub struct ConfigEngine {
    config_path: PathBuf,
    config: RuntimeConfig,
}

impl ConfigEngine {
    /// Creates a new ConfigEngine.
    ///
    /// If `path_override` is `Some`, uses that path for the config file.
    /// Otherwise, uses the platform-specific config directory with `config.json`.
    pub fn new(path_override: Option<PathBuf>) -> Self {
        let config_path = path_override.unwrap_or_else(|| default_config_dir().join(CONFIG_FILE));
        Self {
            config_path,
            config: RuntimeConfig::default(),
        }
    }
}

impl ConfigEngineTrait for ConfigEngine {
    /// Loads the configuration from the JSON config file.
    ///
    /// If the file does not exist, returns the defaults.
    /// If the file exists but is malformed, returns a serialization error.
    fn load(&mut self) -> Result<RuntimeConfig, ConfigError> {
        if !self.config_path.exists() {
            debug!(target: "config", path = %self.config_path.display(), "no config file; using defaults");
            self.config = RuntimeConfig::default();
            return Ok(self.config.clone());
        }

        let content = fs::read_to_string(&self.config_path)
            .map_err(|e| ConfigError::Io(format!("Failed to read config file: {}", e)))?;

        let config: RuntimeConfig = serde_json::from_str(&content)
            .map_err(|e| ConfigError::Serialization(format!("Failed to parse config file: {}", e)))?;

        self.config = config;
        Ok(self.config.clone())
    }

    /// Saves the current configuration to the JSON config file.
    ///
    /// Creates parent directories if they don't exist.
    fn save(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ConfigError::Io(format!("Failed to create config directory: {}", e)))?;
        }

        let json = serde_json::to_string_pretty(&self.config)
            .map_err(|e| ConfigError::Serialization(format!("Failed to serialize config: {}", e)))?;

        fs::write(&self.config_path, json)
            .map_err(|e| ConfigError::Io(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    fn get(&self) -> &RuntimeConfig {
        &self.config
    }

    fn set(&mut self, config: RuntimeConfig) {
        self.config = config;
    }

    fn config_path(&self) -> &Path {
        &self.config_path
    }
}
