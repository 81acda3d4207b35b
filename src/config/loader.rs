use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::types::Config;

/// Errors that can occur when loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to write config file '{path}': {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Config validation failed: {message}")]
    ValidationError { message: String },

    #[error("Unknown setting '{key}'")]
    UnknownKey { key: String },

    #[error("Invalid value '{value}' for setting '{key}'")]
    InvalidValue { key: String, value: String },
}

impl Config {
    /// Returns the path to the configuration file.
    ///
    /// Uses `~/.config/container-attach/config.toml` on Unix/macOS,
    /// or equivalent on other platforms via `dirs::config_dir()`.
    /// Falls back to current directory if config_dir is unavailable.
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        config_dir.join("container-attach").join("config.toml")
    }

    /// Loads configuration from the default config file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Loads configuration from `path`.
    ///
    /// - If the file doesn't exist, returns `Config::default()`.
    /// - If the file exists, parses it as TOML and validates.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration to `path`, creating parent directories.
    ///
    /// The file is written next to its destination and renamed into place
    /// so readers never see a half-written config.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        let content = toml::to_string_pretty(self)?;
        let write_error = |source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_error)?;
        }
        let staging = path.with_extension("toml.tmp");
        fs::write(&staging, content).map_err(write_error)?;
        fs::rename(&staging, path).map_err(write_error)?;
        Ok(())
    }

    /// Validates the configuration.
    ///
    /// Checks:
    /// - The executable path and data root are not empty
    /// - Every timeout is non-zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.executable_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError {
                message: "Executable path must not be empty".to_string(),
            });
        }
        if self.runtime.app_root.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError {
                message: "App root path must not be empty".to_string(),
            });
        }

        let timeouts = [
            ("start_system_seconds", u64::from(self.timeouts.start_system_seconds)),
            ("stop_container_seconds", u64::from(self.timeouts.stop_container_seconds)),
            ("shutdown_system_seconds", u64::from(self.timeouts.shutdown_system_seconds)),
            ("drain_timeout_ms", self.attach.drain_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::ValidationError {
                    message: format!("Timeout '{}' must be greater than zero", name),
                });
            }
        }

        Ok(())
    }

    /// Whether the configured runtime executable exists and is executable.
    pub fn executable_exists(&self) -> bool {
        fs::metadata(&self.runtime.executable_path)
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
}
