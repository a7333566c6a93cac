//! Configuration management for Fastpath
//!
//! This crate loads layered settings (defaults, an optional file and the
//! environment) into a typed [`Settings`] value.

pub mod manager;
pub mod settings;

// Re-export commonly used types
pub use manager::{ConfigManager, ENV_PREFIX};
pub use settings::{BuildFailurePolicy, LogFormat, LogSettings, RemoteSettings, Settings};
