//! Thread-safe configuration storage.
//!
//! Provides an in-memory config container with interior mutability that
//! can be reloaded from and persisted back to its file.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use parking_lot::RwLock;

use crate::config::loader::ConfigError;
use crate::config::settings::SettingKey;
use crate::config::types::Config;

/// Thread-safe config container with interior mutability.
///
/// Allows multiple readers to access config concurrently while
/// supporting atomic updates when needed.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<RwLock<Config>>,
    path: PathBuf,
}

impl ConfigStore {
    /// Create a new ConfigStore from initial config and path.
    pub fn new(config: Config, path: PathBuf) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
            path,
        }
    }

    /// Load the config at `path` (defaults if missing) into a store.
    pub fn open(path: PathBuf) -> Result<Self, ConfigError> {
        let config = Config::load_from(&path)?;
        Ok(Self::new(config, path))
    }

    /// Get a clone of the current config.
    pub fn get(&self) -> Config {
        self.inner.read().clone()
    }

    /// Current value of one setting.
    pub fn setting(&self, key: SettingKey) -> String {
        self.inner.read().get(key)
    }

    /// Change one setting in memory and persist the result.
    pub fn set(&self, key: SettingKey, value: &str) -> Result<(), ConfigError> {
        self.inner.write().set(key, value)?;
        self.persist()
    }

    /// Reload config from the file.
    ///
    /// On success, atomically replaces the current config.
    /// On failure, keeps the old config and returns the error.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let config = Config::load_from(&self.path)?;
        *self.inner.write() = config;
        Ok(())
    }

    /// Write the current config to its file.
    ///
    /// Holds an exclusive lock on a sibling `.lock` file while writing so
    /// two consoles saving at once do not interleave.
    pub fn persist(&self) -> Result<(), ConfigError> {
        let lock_error = |source| ConfigError::WriteError {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(lock_error)?;
        }

        let lock_path = self.path.with_extension("toml.lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(lock_error)?;
        lock.lock_exclusive().map_err(lock_error)?;

        let config = self.get();
        let result = config.save_to(&self.path);
        let _ = FileExt::unlock(&lock);
        result
    }

    /// Get the config file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
