//! JogKit Settings Crate
//!
//! Handles configuration files: loading, validation and saving.

pub mod config;
pub mod error;

pub use config::{Config, ConnectionSettings, DispatcherSettings, EventBusSettings, MachineSettings};
pub use error::{ConfigError, SettingsError, SettingsResult};
