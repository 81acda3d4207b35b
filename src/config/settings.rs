use std::path::PathBuf;
use std::str::FromStr;

use crate::config::loader::ConfigError;
use crate::config::types::Config;

/// Key of a persisted user setting.
///
/// The `as_str()` value is the key used on the command line; once
/// published, do not rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    ExecutablePath,
    AppRoot,
    StartSystemTimeout,
    StopContainerTimeout,
    ShutdownSystemTimeout,
    DrainTimeout,
}

impl SettingKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutablePath => "executable-path",
            Self::AppRoot => "app-root",
            Self::StartSystemTimeout => "start-system-timeout-seconds",
            Self::StopContainerTimeout => "stop-container-timeout-seconds",
            Self::ShutdownSystemTimeout => "shutdown-system-timeout-seconds",
            Self::DrainTimeout => "drain-timeout-ms",
        }
    }

    /// All variants for iteration.
    pub fn all() -> &'static [SettingKey] {
        &[
            Self::ExecutablePath,
            Self::AppRoot,
            Self::StartSystemTimeout,
            Self::StopContainerTimeout,
            Self::ShutdownSystemTimeout,
            Self::DrainTimeout,
        ]
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::all().iter().copied().find(|key| key.as_str() == s)
    }
}

impl FromStr for SettingKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| ConfigError::UnknownKey { key: s.to_string() })
    }
}

impl std::fmt::Display for SettingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Config {
    /// Current value of a setting, rendered as plain text.
    pub fn get(&self, key: SettingKey) -> String {
        match key {
            SettingKey::ExecutablePath => self.runtime.executable_path.display().to_string(),
            SettingKey::AppRoot => self.runtime.app_root.display().to_string(),
            SettingKey::StartSystemTimeout => self.timeouts.start_system_seconds.to_string(),
            SettingKey::StopContainerTimeout => self.timeouts.stop_container_seconds.to_string(),
            SettingKey::ShutdownSystemTimeout => {
                self.timeouts.shutdown_system_seconds.to_string()
            }
            SettingKey::DrainTimeout => self.attach.drain_timeout_ms.to_string(),
        }
    }

    /// Set a setting from plain text. The config is left untouched when the
    /// value does not parse or the result fails validation.
    pub fn set(&mut self, key: SettingKey, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.as_str().to_string(),
            value: value.to_string(),
        };

        let mut updated = self.clone();
        match key {
            SettingKey::ExecutablePath => updated.runtime.executable_path = PathBuf::from(value),
            SettingKey::AppRoot => updated.runtime.app_root = PathBuf::from(value),
            SettingKey::StartSystemTimeout => {
                updated.timeouts.start_system_seconds = value.parse().map_err(|_| invalid())?
            }
            SettingKey::StopContainerTimeout => {
                updated.timeouts.stop_container_seconds = value.parse().map_err(|_| invalid())?
            }
            SettingKey::ShutdownSystemTimeout => {
                updated.timeouts.shutdown_system_seconds = value.parse().map_err(|_| invalid())?
            }
            SettingKey::DrainTimeout => {
                updated.attach.drain_timeout_ms = value.parse().map_err(|_| invalid())?
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Every setting with its current value, in display order.
    pub fn entries(&self) -> Vec<(SettingKey, String)> {
        SettingKey::all()
            .iter()
            .map(|key| (*key, self.get(*key)))
            .collect()
    }
}
