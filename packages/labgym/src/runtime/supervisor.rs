// packages/labgym/src/runtime/supervisor.rs
//! Supervised environment handle
//!
//! [`SubprocessEnv`] owns one worker process and the channel to it, and
//! exposes the worker's environment through the synchronous
//! [`Environment`] trait:
//!
//! ```text
//!   caller ──reset/step──▶ SubprocessEnv ══ socket pair ══▶ worker ──▶ engine
//!          ◀─────────────                ◀══════════════           ◀──
//! ```
//!
//! Lifecycle: *initializing* (inside the constructor) → *ready* → *closed*.
//! Every call blocks on a private single-threaded tokio runtime, so handles
//! must not be used from inside an async task.
//!
//! Shutdown is a sequence of independently fallible steps: send `close`,
//! await the acknowledgement, join, SIGTERM, join, SIGKILL, join. A failure
//! in one step never skips the later ones.

use crate::env::spaces::{Action, Observation, Space};
use crate::env::{Environment, Info, Options, StepResult};
use crate::observability::{METRIC_COMMAND_LATENCY, METRIC_CONSTRUCTION_FAILURES, METRIC_REMOTE_FAILURES};
use crate::registry;
use crate::runtime::factory::{EntryPoints, EnvFactory, WorkerBootstrap};
use crate::runtime::process_manager::{Launcher, WorkerProcess};
use crate::runtime::protocol::{Channel, Command, Handshake, Payload, Reply};
use crate::utils::config::SupervisorConfig;
use crate::utils::errors::{EngineError, Result};
use std::time::Instant;
use tokio::net::UnixStream;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

/// Lifecycle state of a constructed handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Ready,
    Closed,
}

/// Environment running in a dedicated worker process
pub struct SubprocessEnv {
    /// Unique handle id, used in logs
    id: Ulid,

    /// Registered id this handle was made from
    env_id: Option<String>,

    /// Supervisor end of the channel; `None` once closed
    channel: Option<Channel<UnixStream>>,

    /// The worker; `None` once closed and reaped
    worker: Option<WorkerProcess>,

    observation_space: Space,
    action_space: Space,
    config: SupervisorConfig,
    state: HandleState,

    /// Drives the channel and the child; dropped after both
    runtime: Option<Runtime>,
}

impl SubprocessEnv {
    /// Launch a worker for `factory` with default supervisor settings
    pub fn new(factory: EnvFactory) -> Result<Self> {
        Self::with_config(factory, SupervisorConfig::default())
    }

    pub fn with_config(factory: EnvFactory, config: SupervisorConfig) -> Result<Self> {
        Self::launch(None, factory, config, &EntryPoints::builtin())
    }

    /// Launch with a custom entry-point table.
    ///
    /// The table is only consulted by forked workers; exec'd workers use the
    /// table compiled into the worker binary.
    pub fn with_entry_points(
        factory: EnvFactory,
        config: SupervisorConfig,
        entry_points: &EntryPoints,
    ) -> Result<Self> {
        Self::launch(None, factory, config, entry_points)
    }

    /// Launch a worker for a registered environment id
    pub fn from_id(env_id: &str, config: SupervisorConfig) -> Result<Self> {
        let factory = registry::spec(env_id)?;
        Self::launch(Some(env_id.to_string()), factory, config, &EntryPoints::builtin())
    }

    fn launch(
        env_id: Option<String>,
        factory: EnvFactory,
        config: SupervisorConfig,
        entry_points: &EntryPoints,
    ) -> Result<Self> {
        config.validate()?;
        let id = Ulid::new();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let bootstrap = WorkerBootstrap {
            env_id: env_id.clone(),
            factory,
            max_frame_bytes: config.max_frame_bytes,
        };
        let (stream, mut worker) = Launcher::new(&config).launch(&runtime, &bootstrap, entry_points)?;
        let pid = worker.pid();

        let connected = {
            let _guard = runtime.enter();
            stream
                .set_nonblocking(true)
                .and_then(|()| UnixStream::from_std(stream))
        };
        let mut channel = match connected {
            Ok(stream) => Channel::new(stream, config.max_frame_bytes),
            Err(e) => {
                runtime.block_on(reap(&mut worker, &config));
                return Err(EngineError::Io(e));
            }
        };

        let handshake = runtime.block_on(channel.recv::<Handshake>());
        let failure = match handshake {
            Ok(Some(Handshake::Spaces {
                observation_space,
                action_space,
            })) => {
                info!("Supervisor {} ready (worker {:?}, {})", id, pid, bootstrap.factory);
                return Ok(Self {
                    id,
                    env_id,
                    channel: Some(channel),
                    worker: Some(worker),
                    observation_space,
                    action_space,
                    config,
                    state: HandleState::Ready,
                    runtime: Some(runtime),
                });
            }
            Ok(Some(Handshake::Error { description })) => description,
            Ok(None) => "worker exited before completing the handshake".to_string(),
            Err(e) => format!("handshake failed: {}", e),
        };

        error!("Worker {:?} failed to construct {}: {}", pid, bootstrap.factory, failure);
        metrics::counter!(METRIC_CONSTRUCTION_FAILURES).increment(1);
        drop(channel);
        runtime.block_on(reap(&mut worker, &config));
        drop(worker);

        Err(EngineError::ConstructionFailed {
            pid,
            description: failure,
        })
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn env_id(&self) -> Option<&str> {
        self.env_id.as_deref()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == HandleState::Closed
    }

    /// PID of the worker while it has not been reaped
    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.as_ref().and_then(WorkerProcess::pid)
    }

    pub fn is_worker_alive(&mut self) -> bool {
        self.worker.as_mut().map(WorkerProcess::is_alive).unwrap_or(false)
    }

    /// One command, one reply
    fn request(&mut self, command: Command) -> Result<Payload> {
        if self.state == HandleState::Closed {
            return Err(EngineError::HandleClosed);
        }
        let operation = command.name();
        let deadline = self.config.command_timeout();
        let (Some(channel), Some(runtime)) = (self.channel.as_mut(), self.runtime.as_ref()) else {
            return Err(EngineError::HandleClosed);
        };

        debug!("Supervisor {} sending {}", self.id, operation);
        let started = Instant::now();
        let outcome = runtime.block_on(async {
            let round_trip = async {
                channel.send(&command).await?;
                channel.recv::<Reply>().await
            };
            match deadline {
                Some(limit) => tokio::time::timeout(limit, round_trip)
                    .await
                    .map_err(|_| EngineError::CommandTimeout(limit))?,
                None => round_trip.await,
            }
        });
        metrics::histogram!(METRIC_COMMAND_LATENCY, "operation" => operation)
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(Some(Reply::Ok(payload))) => Ok(payload),
            Ok(Some(Reply::Error { description })) => {
                metrics::counter!(METRIC_REMOTE_FAILURES, "operation" => operation).increment(1);
                warn!("Remote {} failed in supervisor {}", operation, self.id);
                Err(EngineError::Remote {
                    operation,
                    description,
                })
            }
            Ok(None) => Err(EngineError::Transport(format!(
                "worker closed the channel during {}",
                operation
            ))),
            Err(EngineError::CommandTimeout(limit)) => {
                warn!(
                    "{} did not complete within {:?}, closing supervisor {}",
                    operation, limit, self.id
                );
                self.close()?;
                Err(EngineError::CommandTimeout(limit))
            }
            Err(e) => Err(e),
        }
    }
}

/// Join, then escalate through SIGTERM and SIGKILL until the worker is gone
async fn reap(worker: &mut WorkerProcess, config: &SupervisorConfig) {
    let pid = worker.pid();

    match worker.join(config.join_timeout()).await {
        Ok(true) => return,
        Ok(false) => warn!(
            "Worker {:?} did not exit within {:?}, sending SIGTERM",
            pid,
            config.join_timeout()
        ),
        Err(e) => warn!("Joining worker {:?} failed: {}", pid, e),
    }

    if let Err(e) = worker.terminate() {
        warn!("SIGTERM to worker {:?} failed: {}", pid, e);
    }
    match worker.join(config.terminate_timeout()).await {
        Ok(true) => return,
        Ok(false) => {}
        Err(e) => warn!("Joining worker {:?} failed: {}", pid, e),
    }

    if let Err(e) = worker.kill() {
        warn!("SIGKILL to worker {:?} failed: {}", pid, e);
    }
    match worker.join(config.terminate_timeout()).await {
        Ok(true) => {}
        Ok(false) => error!("Worker {:?} still running after SIGKILL", pid),
        Err(e) => warn!("Joining worker {:?} failed: {}", pid, e),
    }
}

/// Close handshake (tolerating a broken channel), then reap
async fn shutdown(
    mut channel: Option<Channel<UnixStream>>,
    worker: Option<&mut WorkerProcess>,
    config: &SupervisorConfig,
) {
    if let Some(channel) = channel.as_mut() {
        let handshake = async {
            channel.send(&Command::Close).await?;
            channel.recv::<Reply>().await
        };
        match tokio::time::timeout(config.join_timeout(), handshake).await {
            Ok(Ok(Some(Reply::Ok(Payload::Ack)))) => debug!("Worker acknowledged close"),
            Ok(Ok(Some(other))) => warn!("Unexpected reply to close: {:?}", other),
            Ok(Ok(None)) => debug!("Worker already gone at close"),
            Ok(Err(e)) => debug!("Close handshake failed: {}", e),
            Err(_) => warn!("Close not acknowledged within {:?}", config.join_timeout()),
        }
    }
    drop(channel);

    if let Some(worker) = worker {
        reap(worker, config).await;
    }
}

impl Environment for SubprocessEnv {
    fn observation_space(&self) -> &Space {
        &self.observation_space
    }

    fn action_space(&self) -> &Space {
        &self.action_space
    }

    fn reset(&mut self, seed: Option<i64>, options: Option<Options>) -> Result<(Observation, Info)> {
        match self.request(Command::Reset { seed, options })? {
            Payload::Reset { observation, info } => Ok((observation, info)),
            other => Err(EngineError::Protocol(format!(
                "expected reset payload, got {}",
                other.name()
            ))),
        }
    }

    fn step(&mut self, action: &Action) -> Result<StepResult> {
        match self.request(Command::Step(action.clone()))? {
            Payload::Step(result) => Ok(result),
            other => Err(EngineError::Protocol(format!(
                "expected step payload, got {}",
                other.name()
            ))),
        }
    }

    /// Idempotent; never fails because of the worker
    fn close(&mut self) -> Result<()> {
        if self.state == HandleState::Closed {
            return Ok(());
        }
        self.state = HandleState::Closed;

        let channel = self.channel.take();
        let mut worker = self.worker.take();
        match self.runtime.as_ref() {
            Some(runtime) => {
                runtime.block_on(shutdown(channel, worker.as_mut(), &self.config));
                let _guard = runtime.enter();
                drop(worker);
            }
            None => {
                drop(channel);
                if let Some(mut worker) = worker {
                    worker.kill_blocking();
                }
            }
        }

        info!("Supervisor {} closed", self.id);
        Ok(())
    }
}

impl Drop for SubprocessEnv {
    fn drop(&mut self) {
        if self.state == HandleState::Closed {
            return;
        }

        if tokio::runtime::Handle::try_current().is_ok() {
            // Blocking is not allowed here: skip the handshake
            warn!(
                "Supervisor {} dropped inside an async runtime, killing worker {:?}",
                self.id,
                self.worker_pid()
            );
            self.state = HandleState::Closed;
            self.channel.take();
            if let Some(mut worker) = self.worker.take() {
                worker.kill_blocking();
            }
            if let Some(runtime) = self.runtime.take() {
                runtime.shutdown_background();
            }
            return;
        }

        debug!("Supervisor {} dropped without close", self.id);
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::spaces::{BoxSpace, Dtype, Tensor};
    use crate::runtime::factory::Kwargs;
    use crate::utils::config::LaunchPreference;
    use nix::sys::signal::{kill, signal, SigHandler, Signal};
    use nix::unistd::Pid;
    use serial_test::serial;
    use std::time::Duration;

    fn forked() -> SupervisorConfig {
        SupervisorConfig::default().with_launch(LaunchPreference::Fork)
    }

    fn small_lab() -> EnvFactory {
        EnvFactory::lab("lt_chasm")
            .with_kwarg("width", 16)
            .with_kwarg("height", 12)
    }

    fn gone(pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None).is_err()
    }

    #[test]
    #[serial]
    fn test_forked_worker_round_trip() {
        let mut env = SubprocessEnv::with_config(small_lab(), forked()).unwrap();
        let pid = env.worker_pid().unwrap();
        assert!(env.is_worker_alive());

        let (obs, info) = env.reset(Some(0), None).unwrap();
        assert_eq!(obs.as_array().unwrap().shape(), &[12, 16, 3]);
        assert!(info.is_empty());

        let action = env.action_space().zero_action().unwrap();
        let result = env.step(&action).unwrap();
        assert!(result.reward.is_finite());

        env.close().unwrap();
        env.close().unwrap();
        assert!(env.is_closed());
        assert!(gone(pid));
    }

    #[test]
    #[serial]
    fn test_forked_construction_failure() {
        let factory = EnvFactory::lab("no_such_level");
        match SubprocessEnv::with_config(factory, forked()) {
            Err(EngineError::ConstructionFailed { pid, description }) => {
                assert!(description.contains("no_such_level"));
                assert!(gone(pid.unwrap()));
            }
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("construction should fail"),
        }
    }

    #[test]
    #[serial]
    fn test_use_after_close_is_local() {
        let mut env = SubprocessEnv::with_config(small_lab(), forked()).unwrap();
        env.close().unwrap();
        assert!(matches!(env.reset(None, None), Err(EngineError::HandleClosed)));
        let action = Action::from_i32(vec![0; 7]);
        assert!(matches!(env.step(&action), Err(EngineError::HandleClosed)));
    }

    #[test]
    #[serial]
    fn test_drop_reaps_worker() {
        let env = SubprocessEnv::with_config(small_lab(), forked()).unwrap();
        let pid = env.worker_pid().unwrap();
        drop(env);
        assert!(gone(pid));
    }

    #[test]
    #[serial]
    fn test_remote_failure_then_broken_channel() {
        let mut env = SubprocessEnv::with_config(small_lab(), forked()).unwrap();
        env.reset(Some(0), None).unwrap();

        let out_of_range = Action::from_i32(vec![0, 0, 0, 5, 0, 0, 0]);
        match env.step(&out_of_range) {
            Err(EngineError::Remote { operation, description }) => {
                assert_eq!(operation, "step");
                assert!(description.contains("MOVE_BACK_FORWARD"));
            }
            other => panic!("expected remote failure, got {:?}", other.map(|r| r.reward)),
        }

        let next = env.reset(Some(0), None);
        assert!(matches!(next, Err(EngineError::Transport(_))));
        env.close().unwrap();
    }

    /// Steps and closes slowly, and ignores SIGTERM
    struct Wedged {
        space: Space,
    }

    impl Environment for Wedged {
        fn observation_space(&self) -> &Space {
            &self.space
        }

        fn action_space(&self) -> &Space {
            &self.space
        }

        fn reset(&mut self, _seed: Option<i64>, _options: Option<Options>) -> Result<(Observation, Info)> {
            Ok((Observation::Array(Tensor::vector_i32(vec![0])), Info::new()))
        }

        fn step(&mut self, _action: &Action) -> Result<StepResult> {
            std::thread::sleep(Duration::from_secs(30));
            Err(EngineError::Engine("unreachable".to_string()))
        }

        fn close(&mut self) -> Result<()> {
            std::thread::sleep(Duration::from_secs(30));
            Ok(())
        }
    }

    fn wedged_entry_points() -> EntryPoints {
        let mut entry_points = EntryPoints::new();
        entry_points.insert("test:Wedged", |_| {
            // SAFETY: replacing a disposition with SIG_IGN installs no handler code
            unsafe { signal(Signal::SIGTERM, SigHandler::SigIgn) }?;
            Ok(Box::new(Wedged {
                space: Space::Box(BoxSpace::uniform(0.0, 1.0, vec![1], Dtype::I32)),
            }) as Box<dyn Environment>)
        });
        entry_points
    }

    fn impatient() -> SupervisorConfig {
        SupervisorConfig {
            join_timeout_ms: 200,
            terminate_timeout_ms: 200,
            ..forked()
        }
    }

    #[test]
    #[serial]
    fn test_wedged_worker_escalates_to_kill() {
        let factory = EnvFactory::new("test:Wedged", Kwargs::new());
        let mut env = SubprocessEnv::with_entry_points(factory, impatient(), &wedged_entry_points()).unwrap();
        let pid = env.worker_pid().unwrap();
        env.reset(None, None).unwrap();

        let started = Instant::now();
        env.close().unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(gone(pid));
    }

    #[test]
    #[serial]
    fn test_command_timeout_closes_handle() {
        let factory = EnvFactory::new("test:Wedged", Kwargs::new());
        let config = SupervisorConfig {
            command_timeout_ms: Some(200),
            ..impatient()
        };
        let mut env = SubprocessEnv::with_entry_points(factory, config, &wedged_entry_points()).unwrap();
        let pid = env.worker_pid().unwrap();

        let result = env.step(&Action::from_i32(vec![0]));
        assert!(matches!(result, Err(EngineError::CommandTimeout(_))));
        assert!(env.is_closed());
        assert!(gone(pid));
        assert!(matches!(env.reset(None, None), Err(EngineError::HandleClosed)));
    }

    #[test]
    fn test_invalid_config_rejected_before_launch() {
        let config = SupervisorConfig {
            max_frame_bytes: 8,
            ..forked()
        };
        assert!(matches!(
            SubprocessEnv::with_config(small_lab(), config),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    #[serial]
    fn test_forked_worker_ignores_held_registry_lock() {
        let id = registry::register("lt_chasm", 7, small_lab().kwargs.clone());
        let factory = registry::spec(&id).unwrap();

        // Another thread owns the registry lock across the fork
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = std::thread::spawn(move || {
            let _guard = registry::REGISTRY.write();
            locked_tx.send(()).unwrap();
            let _ = release_rx.recv();
        });
        locked_rx.recv().unwrap();

        let launched =
            SubprocessEnv::launch(Some(id.clone()), factory, forked(), &EntryPoints::builtin());
        release_tx.send(()).unwrap();
        holder.join().unwrap();

        let mut env = launched.unwrap();
        assert_eq!(env.env_id(), Some(id.as_str()));
        env.reset(Some(0), None).unwrap();
        env.close().unwrap();
    }
}
