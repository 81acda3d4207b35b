mod loader;
mod settings;
mod store;
mod types;

pub use loader::ConfigError;
pub use settings::SettingKey;
pub use store::ConfigStore;
pub use types::{AttachSettings, Config, RuntimeSettings, Timeouts};
