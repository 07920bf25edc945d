// packages/labgym/src/runtime/process_manager.rs
//! Worker process launching and lifecycle
//!
//! Two launch strategies:
//! - **Exec**: spawn a fresh `labgym-worker` binary with the socket installed
//!   as fd 3 and the factory in its environment. Nothing from the caller's
//!   address space leaks into the worker.
//! - **Fork**: copy-on-write fork of the caller; the child serves the
//!   environment over a blocking channel and `_exit`s. Used only when no
//!   worker binary is available.
//!
//! [`WorkerProcess`] wraps either kind of child with bounded joins and
//! SIGTERM/SIGKILL escalation, and never leaves a zombie behind.

use crate::observability::{METRIC_FORCED_TERMINATIONS, METRIC_WORKERS_LAUNCHED};
use crate::runtime::factory::{EntryPoints, WorkerBootstrap};
use crate::runtime::worker::{self, BOOTSTRAP_ENV, WORKER_FD_ENV};
use crate::utils::config::{LaunchPreference, SupervisorConfig};
use crate::utils::errors::{EngineError, Result};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

/// Name of the worker binary looked up next to the current executable
pub const WORKER_BINARY: &str = "labgym-worker";

/// Environment variable naming the worker binary
pub const WORKER_PROGRAM_ENV: &str = "LABGYM_WORKER_PROGRAM";

/// Descriptor number the worker end is installed at in an exec'd child
pub const WORKER_FD: RawFd = 3;

const FORK_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Resolved launch strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchStrategy {
    Exec(PathBuf),
    Fork,
}

impl LaunchStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            LaunchStrategy::Exec(_) => "exec",
            LaunchStrategy::Fork => "fork",
        }
    }
}

/// Chooses a strategy and launches workers
pub struct Launcher {
    preference: LaunchPreference,
    worker_program: Option<PathBuf>,
}

impl Launcher {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            preference: config.launch,
            worker_program: config.worker_program.clone(),
        }
    }

    /// Find the worker binary: configured path, then the environment, then
    /// next to the current executable (or its parent, for test binaries
    /// living in `deps/`).
    pub fn find_worker_program(&self) -> Option<PathBuf> {
        if let Some(program) = &self.worker_program {
            return Some(program.clone());
        }

        if let Some(program) = std::env::var_os(WORKER_PROGRAM_ENV) {
            return Some(PathBuf::from(program));
        }

        let exe = std::env::current_exe().ok()?;
        exe.ancestors()
            .skip(1)
            .take(2)
            .map(|dir| dir.join(WORKER_BINARY))
            .find(|candidate| candidate.is_file())
    }

    /// Apply the preference to what is available on this host
    pub fn strategy(&self) -> Result<LaunchStrategy> {
        match self.preference {
            LaunchPreference::Fork => Ok(LaunchStrategy::Fork),
            LaunchPreference::Exec => self
                .find_worker_program()
                .map(LaunchStrategy::Exec)
                .ok_or_else(|| {
                    EngineError::ProcessSpawnFailed(format!(
                        "no {} binary found; set {} or supervisor.worker_program",
                        WORKER_BINARY, WORKER_PROGRAM_ENV
                    ))
                }),
            LaunchPreference::Auto => match self.find_worker_program() {
                Some(program) => Ok(LaunchStrategy::Exec(program)),
                None => {
                    warn!("No {} binary found, falling back to fork", WORKER_BINARY);
                    Ok(LaunchStrategy::Fork)
                }
            },
        }
    }

    /// Create the channel and launch a worker bound to its far end.
    ///
    /// Returns the supervisor's end of the socket. The worker's end is
    /// closed in this process before returning.
    pub fn launch(
        &self,
        runtime: &Runtime,
        bootstrap: &WorkerBootstrap,
        entry_points: &EntryPoints,
    ) -> Result<(StdUnixStream, WorkerProcess)> {
        let strategy = self.strategy()?;
        let (supervisor_end, worker_end) = StdUnixStream::pair()?;

        let process = match &strategy {
            LaunchStrategy::Exec(program) => {
                // Child reaping is driven by the runtime
                let _guard = runtime.enter();
                spawn_exec(program, &worker_end, bootstrap)?
            }
            LaunchStrategy::Fork => spawn_fork(supervisor_end.as_raw_fd(), worker_end, bootstrap, entry_points)?,
        };

        metrics::counter!(METRIC_WORKERS_LAUNCHED, "strategy" => strategy.name()).increment(1);
        info!(
            "Launched worker {:?} via {} for {}",
            process.pid(),
            strategy.name(),
            bootstrap.factory
        );
        Ok((supervisor_end, process))
    }
}

fn spawn_exec(program: &Path, worker_end: &StdUnixStream, bootstrap: &WorkerBootstrap) -> Result<WorkerProcess> {
    let child_fd = worker_end.as_raw_fd();
    debug!("Spawning worker {:?} with channel fd {}", program, child_fd);

    let mut command = Command::new(program);
    command
        .env(WORKER_FD_ENV, WORKER_FD.to_string())
        .env(BOOTSTRAP_ENV, bootstrap.to_json()?)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    // SAFETY: only async-signal-safe libc calls run between fork and exec.
    unsafe {
        command.pre_exec(move || {
            if child_fd == WORKER_FD {
                // Socket pairs are created close-on-exec
                if libc::fcntl(WORKER_FD, libc::F_SETFD, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
            } else if libc::dup2(child_fd, WORKER_FD) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command
        .spawn()
        .map_err(|e| EngineError::ProcessSpawnFailed(format!("failed to spawn {:?}: {}", program, e)))?;
    Ok(WorkerProcess::Spawned(child))
}

fn spawn_fork(
    supervisor_fd: RawFd,
    worker_end: StdUnixStream,
    bootstrap: &WorkerBootstrap,
    entry_points: &EntryPoints,
) -> Result<WorkerProcess> {
    // SAFETY: the child never returns into the caller's code; it serves over
    // a blocking socket without any tokio runtime and leaves through `_exit`.
    match unsafe { fork() }.map_err(|e| EngineError::ProcessSpawnFailed(format!("fork failed: {}", e)))? {
        ForkResult::Parent { child } => {
            drop(worker_end);
            Ok(WorkerProcess::Forked { pid: child, reaped: false })
        }
        ForkResult::Child => {
            let keep = worker_end.as_raw_fd();
            close_inherited_fds(keep, supervisor_fd);
            let code = worker::run_forked(worker_end, bootstrap.clone(), entry_points);
            // SAFETY: terminate without running the parent's atexit handlers
            unsafe { libc::_exit(code) }
        }
    }
}

/// Close every descriptor above stderr except `keep`, so the forked worker
/// holds no other handle's socket open.
///
/// This includes tokio's process-wide signal pipe, which is why the forked
/// worker must never build a runtime.
fn close_inherited_fds(keep: RawFd, supervisor_fd: RawFd) {
    let fds: Vec<RawFd> = match std::fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
            .collect(),
        Err(_) => vec![supervisor_fd],
    };
    for fd in fds {
        if fd > 2 && fd != keep {
            // SAFETY: the child owns its copies of these descriptors
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// Handle to a launched worker
#[derive(Debug)]
pub enum WorkerProcess {
    /// Exec'd worker binary
    Spawned(Child),
    /// Forked copy of the caller
    Forked { pid: Pid, reaped: bool },
}

impl WorkerProcess {
    pub fn pid(&self) -> Option<u32> {
        match self {
            WorkerProcess::Spawned(child) => child.id(),
            WorkerProcess::Forked { pid, reaped: false } => Some(pid.as_raw() as u32),
            WorkerProcess::Forked { .. } => None,
        }
    }

    /// Wait up to `timeout` for the worker to exit. Returns whether it has.
    pub async fn join(&mut self, timeout: Duration) -> Result<bool> {
        match self {
            WorkerProcess::Spawned(child) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!("Worker exited with {}", status);
                    Ok(true)
                }
                Ok(Err(e)) => Err(EngineError::Io(e)),
                Err(_) => Ok(false),
            },
            WorkerProcess::Forked { pid, reaped } => {
                let deadline = tokio::time::Instant::now() + timeout;
                loop {
                    if *reaped || try_reap(*pid)? {
                        *reaped = true;
                        return Ok(true);
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Ok(false);
                    }
                    tokio::time::sleep(FORK_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Ask the worker to exit (SIGTERM)
    pub fn terminate(&self) -> Result<()> {
        if let Some(pid) = self.pid() {
            debug!("Sending SIGTERM to worker {}", pid);
            kill(Pid::from_raw(pid as i32), Signal::SIGTERM)?;
        }
        Ok(())
    }

    /// Kill the worker outright (SIGKILL)
    pub fn kill(&mut self) -> Result<()> {
        if let Some(pid) = self.pid() {
            warn!("Sending SIGKILL to worker {}", pid);
            metrics::counter!(METRIC_FORCED_TERMINATIONS).increment(1);
            match self {
                WorkerProcess::Spawned(child) => child.start_kill()?,
                WorkerProcess::Forked { pid, .. } => kill(*pid, Signal::SIGKILL)?,
            }
        }
        Ok(())
    }

    /// Kill and reap without waiting on a runtime
    pub fn kill_blocking(&mut self) {
        let pid = self.pid();
        if let Err(e) = self.kill() {
            warn!("Failed to kill worker {:?}: {}", pid, e);
        }
        if let Some(pid) = pid {
            let _ = waitpid(Pid::from_raw(pid as i32), None);
        }
        if let WorkerProcess::Forked { reaped, .. } = self {
            *reaped = true;
        }
    }

    /// Whether the worker is still running (reaps it if it has exited)
    pub fn is_alive(&mut self) -> bool {
        match self {
            WorkerProcess::Spawned(child) => matches!(child.try_wait(), Ok(None)),
            WorkerProcess::Forked { reaped: true, .. } => false,
            WorkerProcess::Forked { pid, reaped } => match try_reap(*pid) {
                Ok(true) => {
                    *reaped = true;
                    false
                }
                Ok(false) => true,
                Err(_) => false,
            },
        }
    }
}

/// Non-blocking reap. `Ok(true)` once the child is gone.
fn try_reap(pid: Pid) -> Result<bool> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => Ok(false),
        Ok(status) => {
            debug!("Forked worker {} finished: {:?}", pid, status);
            Ok(!matches!(status, WaitStatus::Stopped(..) | WaitStatus::Continued(_)))
        }
        Err(nix::errno::Errno::ECHILD) => Ok(true),
        Err(e) => Err(e.into()),
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        // Spawned children are killed by `kill_on_drop` and reaped by tokio
        if let WorkerProcess::Forked { pid, reaped: false } = self {
            let _ = kill(*pid, Signal::SIGKILL);
            let _ = waitpid(*pid, None);
        }
    }
}
