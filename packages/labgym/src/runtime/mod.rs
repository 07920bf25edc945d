// packages/labgym/src/runtime/mod.rs
//! Process-isolation runtime
//!
//! This module keeps each environment in its own worker process:
//!
//! - **Protocol**: framed MessagePack messages over a Unix socket pair
//! - **Factory**: serializable environment recipes and entry-point tables
//! - **Worker**: the loop that owns one environment inside the worker
//! - **Process Manager**: exec/fork launch, bounded joins, signal escalation
//! - **Supervisor**: the caller-side handle implementing `Environment`
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────── caller process ────────────────┐
//! │                                                │
//! │  SubprocessEnv ── Launcher ── WorkerProcess    │
//! │       │                            │           │
//! │   Channel (socket pair)        exec / fork     │
//! └───────┼────────────────────────────┼───────────┘
//!         │                            ▼
//! ┌───────┼──────── worker process ────────────────┐
//! │       └──── serve() ──── Environment ── Engine │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! One worker per handle, one request in flight per channel.

pub mod factory;
pub mod process_manager;
pub mod protocol;
pub mod supervisor;
pub mod worker;

// Re-export commonly used types
pub use factory::{EntryPoints, EnvFactory, Kwargs, WorkerBootstrap};
pub use process_manager::{LaunchStrategy, Launcher, WorkerProcess};
pub use protocol::{BlockingChannel, Channel, Command, Handshake, Payload, Reply};
pub use supervisor::{HandleState, SubprocessEnv};
pub use worker::{run_forked, run_from_env, serve, serve_blocking, WorkerExit};
