// packages/labgym/src/utils/config.rs
//! Layered configuration
//!
//! Sources, lowest priority first:
//! - built-in defaults
//! - `labgym.{toml,yaml,json}` in the working directory (optional)
//! - `LABGYM__<SECTION>__<KEY>` environment variables

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub supervisor: SupervisorConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load from the default file (if present) and the environment
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("labgym").required(false))
            .add_source(config::Environment::with_prefix("LABGYM").separator("__"))
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit file, still honouring environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()))
            .add_source(config::Environment::with_prefix("LABGYM").separator("__"))
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.supervisor.validate()
    }
}

/// How the supervisor launches its worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchPreference {
    /// Exec a worker binary if one can be found, otherwise fork
    #[default]
    Auto,
    /// Always exec a fresh worker binary
    Exec,
    /// Fork the caller (copy-on-write) and run the worker in the child
    Fork,
}

/// Smallest accepted `max_frame_bytes`
pub const MIN_FRAME_BYTES: usize = 1024;

/// Supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Launch strategy preference
    pub launch: LaunchPreference,

    /// Worker binary to exec
    pub worker_program: Option<PathBuf>,

    /// Grace period for the worker to exit on its own during close
    pub join_timeout_ms: u64,

    /// Wait after SIGTERM before escalating to SIGKILL
    pub terminate_timeout_ms: u64,

    /// Optional deadline for a single reset/step round trip
    pub command_timeout_ms: Option<u64>,

    /// Largest frame accepted on the channel
    pub max_frame_bytes: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            launch: LaunchPreference::Auto,
            worker_program: None,
            join_timeout_ms: 5_000,
            terminate_timeout_ms: 1_000,
            command_timeout_ms: None,
            max_frame_bytes: 64 * 1024 * 1024,
        }
    }
}

impl SupervisorConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    /// Point the supervisor at a specific worker binary
    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn with_launch(mut self, launch: LaunchPreference) -> Self {
        self.launch = launch;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_frame_bytes < MIN_FRAME_BYTES {
            return Err(EngineError::Config(format!(
                "max_frame_bytes must be at least {}, got {}",
                MIN_FRAME_BYTES, self.max_frame_bytes
            )));
        }
        if self.command_timeout_ms == Some(0) {
            return Err(EngineError::Config(
                "command_timeout_ms must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
