// packages/labgym/tests/common/mod.rs
//! Shared helpers for the integration tests

use labgym::utils::config::{LaunchPreference, SupervisorConfig};
use labgym::EnvFactory;
use nix::sys::signal::kill;
use nix::unistd::Pid;

pub const WIDTH: i64 = 16;
pub const HEIGHT: i64 = 12;

/// Supervisor settings that exec the worker binary built with these tests
pub fn exec_config() -> SupervisorConfig {
    SupervisorConfig::default()
        .with_launch(LaunchPreference::Exec)
        .with_worker_program(env!("CARGO_BIN_EXE_labgym-worker"))
}

/// Small-frame lab factory
#[allow(dead_code)]
pub fn lab(level: &str) -> EnvFactory {
    EnvFactory::lab(level)
        .with_kwarg("width", WIDTH)
        .with_kwarg("height", HEIGHT)
}

/// Whether no process with this pid exists any more
#[allow(dead_code)]
pub fn process_gone(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_err()
}

/// Install a test subscriber once; later calls are no-ops
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "labgym=warn".into()),
        )
        .with_test_writer()
        .try_init();
}
