//! GCodeStream Settings Crate
//!
//! Connection, streaming and jogging defaults, stored as TOML or JSON in the
//! platform's configuration directory.

pub mod config;
pub mod error;

pub use config::{Config, ConnectionSettings, MachineSettings, StreamingSettings};
pub use error::{Result, SettingsError};
