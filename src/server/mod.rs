//! Server module for Drover
//!
//! Contains configuration, wiring and the main run loop.

mod config;
mod init;
mod loader;

pub use config::{AppConfig, LogFormat, LoggingSettings};
pub use init::{run, App};
pub use loader::load_config;
