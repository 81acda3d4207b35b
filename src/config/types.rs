use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub attach: AttachSettings,
}

/// Where the container runtime lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Container runtime executable (default: /usr/local/bin/container).
    #[serde(default = "default_executable_path")]
    pub executable_path: PathBuf,
    /// Root directory for runtime data.
    #[serde(default = "default_app_root")]
    pub app_root: PathBuf,
}

/// Timeouts handed to runtime lifecycle calls, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Waiting for the runtime system to start (default: 10).
    #[serde(default = "default_start_system")]
    pub start_system_seconds: u32,
    /// Grace period before stopped containers are killed (default: 5).
    #[serde(default = "default_stop_container")]
    pub stop_container_seconds: u32,
    /// Waiting for the runtime system to shut down (default: 20).
    #[serde(default = "default_shutdown_system")]
    pub shutdown_system_seconds: u32,
}

/// Process attach settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachSettings {
    /// How long to wait for output streams to drain after exit (default: 3000).
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_executable_path() -> PathBuf {
    PathBuf::from("/usr/local/bin/container")
}

fn default_app_root() -> PathBuf {
    let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    data_dir.join("container-attach")
}

fn default_start_system() -> u32 {
    10
}

fn default_stop_container() -> u32 {
    5
}

fn default_shutdown_system() -> u32 {
    20
}

fn default_drain_timeout_ms() -> u64 {
    3000
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            executable_path: default_executable_path(),
            app_root: default_app_root(),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            start_system_seconds: default_start_system(),
            stop_container_seconds: default_stop_container(),
            shutdown_system_seconds: default_shutdown_system(),
        }
    }
}

impl Default for AttachSettings {
    fn default() -> Self {
        Self {
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl AttachSettings {
    pub fn drain_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.drain_timeout_ms)
    }
}
