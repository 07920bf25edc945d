// packages/labgym/src/utils/mod.rs
//! Crate-wide configuration and error types

pub mod config;
pub mod errors;

pub use config::{EngineConfig, LaunchPreference, LoggingConfig, SupervisorConfig};
pub use errors::{EngineError, Result};
