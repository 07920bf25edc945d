// packages/labgym/src/lib.rs
//! labgym: process-isolated reinforcement-learning environments
//!
//! Native 3D engines keep process-global state, so only one instance may
//! live in a process. This library runs every environment in a dedicated
//! worker process and exposes it through a standard reset/step/close
//! interface.
//!
//! # Architecture
//!
//! The library is structured into several key modules:
//!
//! - **runtime**: supervisor, worker loop, wire protocol, process management
//! - **env**: environment interface, spaces, the lab adapter and wrappers
//! - **engine**: native engine boundary and a deterministic software engine
//! - **registry**: string id → factory registration and lookup
//! - **observability**: tracing subscriber and metric names
//! - **utils**: configuration and errors
//!
//! # Example
//!
//! ```no_run
//! use labgym::{Environment, EnvFactory, SubprocessEnv};
//!
//! let mut env = SubprocessEnv::new(EnvFactory::lab("lt_chasm"))?;
//! let (_observation, _info) = env.reset(Some(0), None)?;
//! let action = env.action_space().zero_action()?;
//! let result = env.step(&action)?;
//! println!("reward {}", result.reward);
//! env.close()?;
//! # Ok::<(), labgym::EngineError>(())
//! ```

// Public module exports
pub mod engine;
pub mod env;
pub mod observability;
pub mod registry;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use env::{Action, ActionDiscretize, Environment, LabConfig, LabEnv, Observation, Space, SplitRgbd, StepResult};
pub use runtime::{EntryPoints, EnvFactory, SubprocessEnv};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}
