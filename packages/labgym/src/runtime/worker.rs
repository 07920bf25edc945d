// packages/labgym/src/runtime/worker.rs
//! Worker side of the supervisor/worker pair
//!
//! Runs inside the isolated process and owns exactly one environment:
//! - **Initialization**: build the environment from the factory and announce
//!   its spaces, or report why construction failed
//! - **Serve loop**: one reply per command until `close`, a fault or the
//!   supervisor going away
//! - **Teardown**: best-effort environment close, then the channel is dropped
//!
//! Panics inside the factory or an environment call are caught and reported
//! like any other failure, so the supervisor always gets a description.

use crate::env::Environment;
use crate::registry;
use crate::runtime::factory::{EntryPoints, EnvFactory, WorkerBootstrap};
use crate::runtime::protocol::{
    BlockingChannel, Channel, Command, Handshake, Payload, Reply, DEFAULT_MAX_FRAME_BYTES,
};
use crate::utils::config::MIN_FRAME_BYTES;
use crate::utils::errors::{EngineError, Result};
use std::any::Any;
use std::backtrace::Backtrace;
use std::io::{Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

/// Environment variable carrying the inherited socket's descriptor number
pub const WORKER_FD_ENV: &str = "LABGYM_WORKER_FD";

/// Environment variable carrying the JSON [`WorkerBootstrap`]
pub const BOOTSTRAP_ENV: &str = "LABGYM_WORKER_BOOTSTRAP";

/// Exit status when the worker could not take over its socket or bootstrap
pub const BOOTSTRAP_FAILURE_CODE: i32 = 2;

/// Why the worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Acknowledged a `close` command
    Closed,
    /// Supervisor closed or broke the channel
    PeerGone,
    /// Factory failed; the serve loop never ran
    ConstructionFailed,
    /// An environment call failed and was reported
    Faulted,
    /// Received a frame that is not a command
    ProtocolViolation,
}

impl WorkerExit {
    /// Process exit status for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerExit::Closed | WorkerExit::PeerGone => 0,
            WorkerExit::ConstructionFailed => 3,
            WorkerExit::Faulted => 4,
            WorkerExit::ProtocolViolation => 5,
        }
    }
}

/// Human-readable failure description with the worker's backtrace attached
fn describe_failure(context: &str, message: &str) -> String {
    format!(
        "{}: {}\n\nworker backtrace:\n{}",
        context,
        message,
        Backtrace::force_capture()
    )
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic with a non-string payload".to_string()
    }
}

/// Run `f`, turning both errors and panics into a failure description
fn guarded<R>(context: &str, f: impl FnOnce() -> Result<R>) -> std::result::Result<R, String> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(describe_failure(context, &e.to_string())),
        Err(payload) => Err(describe_failure(context, &panic_message(payload.as_ref()))),
    }
}

fn dispatch(env: &mut dyn Environment, command: Command) -> Result<Payload> {
    match command {
        Command::Reset { seed, options } => {
            let (observation, info) = env.reset(seed, options)?;
            Ok(Payload::Reset { observation, info })
        }
        Command::Step(action) => Ok(Payload::Step(env.step(&action)?)),
        Command::Close => Ok(Payload::Ack),
    }
}

/// Build the environment under [`guarded`], logging a failure
fn construct(
    factory: &EnvFactory,
    entry_points: &EntryPoints,
) -> std::result::Result<Box<dyn Environment>, String> {
    guarded("environment construction failed", || factory.build(entry_points)).map_err(|description| {
        error!("Failed to construct {}: {}", factory, description);
        description
    })
}

fn spaces_of(env: &dyn Environment) -> Handshake {
    Handshake::Spaces {
        observation_space: env.observation_space().clone(),
        action_space: env.action_space().clone(),
    }
}

/// Reply to one command, plus the exit reason if the loop must stop
fn respond(env: &mut dyn Environment, command: Command) -> (Reply, Option<WorkerExit>) {
    let operation = command.name();
    debug!("Handling {}", operation);

    if let Command::Close = command {
        return (Reply::Ok(Payload::Ack), Some(WorkerExit::Closed));
    }

    let context = format!("{} failed", operation);
    match guarded(&context, || dispatch(&mut *env, command)) {
        Ok(payload) => (Reply::Ok(payload), None),
        Err(description) => {
            error!("{}", description);
            (Reply::Error { description }, Some(WorkerExit::Faulted))
        }
    }
}

fn protocol_violation(message: &str) -> Reply {
    error!("Protocol violation: {}", message);
    Reply::Error {
        description: format!("protocol violation: {}", message),
    }
}

/// Best-effort environment close
fn teardown(mut env: Box<dyn Environment>, exit: WorkerExit) -> WorkerExit {
    match catch_unwind(AssertUnwindSafe(|| env.close())) {
        Ok(Ok(())) => debug!("Environment closed"),
        Ok(Err(e)) => warn!("Environment close failed: {}", e),
        Err(payload) => warn!("Environment close panicked: {}", panic_message(payload.as_ref())),
    }
    drop(env);
    info!("Worker exiting: {:?}", exit);
    exit
}

/// Build the environment, announce it and serve commands until done
pub async fn serve<T>(
    io: T,
    factory: &EnvFactory,
    entry_points: &EntryPoints,
    max_frame_bytes: usize,
) -> WorkerExit
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut channel = Channel::new(io, max_frame_bytes);

    let mut env = match construct(factory, entry_points) {
        Ok(env) => env,
        Err(description) => {
            if let Err(e) = channel.send(&Handshake::Error { description }).await {
                warn!("Could not report construction failure: {}", e);
            }
            return WorkerExit::ConstructionFailed;
        }
    };

    let exit = match channel.send(&spaces_of(env.as_ref())).await {
        Ok(()) => {
            info!("Worker ready for {}", factory);
            serve_commands(&mut channel, env.as_mut()).await
        }
        Err(e) => {
            warn!("Supervisor gone before handshake: {}", e);
            WorkerExit::PeerGone
        }
    };
    let exit = teardown(env, exit);
    drop(channel);
    exit
}

async fn serve_commands<T>(channel: &mut Channel<T>, env: &mut dyn Environment) -> WorkerExit
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let command: Command = match channel.recv().await {
            Ok(Some(command)) => command,
            Ok(None) => {
                info!("Supervisor closed the channel");
                return WorkerExit::PeerGone;
            }
            Err(EngineError::Protocol(message)) => {
                let _ = channel.send(&protocol_violation(&message)).await;
                return WorkerExit::ProtocolViolation;
            }
            Err(e) => {
                warn!("Channel broken: {}", e);
                return WorkerExit::PeerGone;
            }
        };

        let operation = command.name();
        let (reply, exit) = respond(env, command);
        if let Err(e) = channel.send(&reply).await {
            warn!("Could not send {} reply: {}", operation, e);
            return exit.unwrap_or(WorkerExit::PeerGone);
        }
        if let Some(exit) = exit {
            return exit;
        }
    }
}

/// [`serve`] without a tokio runtime, over a blocking stream
pub fn serve_blocking<T>(
    io: T,
    factory: &EnvFactory,
    entry_points: &EntryPoints,
    max_frame_bytes: usize,
) -> WorkerExit
where
    T: Read + Write,
{
    let mut channel = BlockingChannel::new(io, max_frame_bytes);

    let mut env = match construct(factory, entry_points) {
        Ok(env) => env,
        Err(description) => {
            if let Err(e) = channel.send(&Handshake::Error { description }) {
                warn!("Could not report construction failure: {}", e);
            }
            return WorkerExit::ConstructionFailed;
        }
    };

    let exit = match channel.send(&spaces_of(env.as_ref())) {
        Ok(()) => {
            info!("Worker ready for {}", factory);
            loop {
                let command: Command = match channel.recv() {
                    Ok(Some(command)) => command,
                    Ok(None) => {
                        info!("Supervisor closed the channel");
                        break WorkerExit::PeerGone;
                    }
                    Err(EngineError::Protocol(message)) => {
                        let _ = channel.send(&protocol_violation(&message));
                        break WorkerExit::ProtocolViolation;
                    }
                    Err(e) => {
                        warn!("Channel broken: {}", e);
                        break WorkerExit::PeerGone;
                    }
                };

                let operation = command.name();
                let (reply, exit) = respond(env.as_mut(), command);
                if let Err(e) = channel.send(&reply) {
                    warn!("Could not send {} reply: {}", operation, e);
                    break exit.unwrap_or(WorkerExit::PeerGone);
                }
                if let Some(exit) = exit {
                    break exit;
                }
            }
        }
        Err(e) => {
            warn!("Supervisor gone before handshake: {}", e);
            WorkerExit::PeerGone
        }
    };
    let exit = teardown(env, exit);
    drop(channel);
    exit
}

/// Re-register the bootstrap's id (if any) and return the factory to build.
///
/// Only for exec'd workers: a forked worker already has the caller's
/// registry and must not take its lock.
fn resolve_bootstrap(bootstrap: &WorkerBootstrap) -> Result<EnvFactory> {
    if bootstrap.max_frame_bytes < MIN_FRAME_BYTES {
        return Err(EngineError::Config(format!(
            "bootstrap max_frame_bytes must be at least {}, got {}",
            MIN_FRAME_BYTES, bootstrap.max_frame_bytes
        )));
    }
    match &bootstrap.env_id {
        Some(id) => {
            registry::register_factory(id, bootstrap.factory.clone());
            registry::spec(id)
        }
        None => Ok(bootstrap.factory.clone()),
    }
}

/// Take over the inherited socket and serve the bootstrap's factory.
///
/// Every failure before the handshake is reported to the supervisor as a
/// [`Handshake::Error`], so construction never fails without a reason.
fn serve_inherited(
    stream: StdUnixStream,
    bootstrap: Result<WorkerBootstrap>,
    entry_points: &EntryPoints,
) -> i32 {
    let prepared = bootstrap.and_then(|bootstrap| {
        let factory = resolve_bootstrap(&bootstrap)?;
        Ok((factory, bootstrap.max_frame_bytes))
    });
    let (factory, max_frame_bytes) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => return report_bootstrap_failure(stream, &e),
    };
    debug!("Worker bootstrap for {}", factory);

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => return report_bootstrap_failure(stream, &EngineError::Io(e)),
    };

    let adopted = {
        let _guard = runtime.enter();
        stream.try_clone().and_then(|clone| {
            clone.set_nonblocking(true)?;
            tokio::net::UnixStream::from_std(clone)
        })
    };
    let io = match adopted {
        Ok(io) => io,
        Err(e) => return report_bootstrap_failure(stream, &EngineError::Io(e)),
    };
    drop(stream);

    runtime
        .block_on(serve(io, &factory, entry_points, max_frame_bytes))
        .exit_code()
}

/// Entry point of an exec'd worker binary.
///
/// Reads the inherited socket from [`WORKER_FD_ENV`] and the factory from
/// [`BOOTSTRAP_ENV`], serves until done and returns the process exit code.
/// Custom worker binaries call this with their own entry-point table.
pub fn run_from_env(entry_points: &EntryPoints) -> i32 {
    let fd: RawFd = match std::env::var(WORKER_FD_ENV).ok().and_then(|v| v.parse().ok()) {
        Some(fd) => fd,
        None => {
            error!("{} is not set; this binary is launched by a supervisor", WORKER_FD_ENV);
            return BOOTSTRAP_FAILURE_CODE;
        }
    };
    // SAFETY: the supervisor installs a connected socket at this descriptor
    // and nothing else in this process owns it.
    let stream = unsafe { StdUnixStream::from_raw_fd(fd) };

    let bootstrap = std::env::var(BOOTSTRAP_ENV)
        .map_err(|e| EngineError::Config(format!("{}: {}", BOOTSTRAP_ENV, e)))
        .and_then(|raw| WorkerBootstrap::from_json(&raw));
    serve_inherited(stream, bootstrap, entry_points)
}

/// Entry point of a forked worker; the caller `_exit`s with the result.
///
/// Builds no tokio runtime and takes no registry lock: the child inherits
/// the caller's runtime globals and locks in whatever state they were at
/// fork time.
pub fn run_forked(
    stream: StdUnixStream,
    bootstrap: WorkerBootstrap,
    entry_points: &EntryPoints,
) -> i32 {
    if let Err(e) = stream.set_nonblocking(false) {
        return report_bootstrap_failure(stream, &EngineError::Io(e));
    }
    serve_blocking(stream, &bootstrap.factory, entry_points, bootstrap.max_frame_bytes).exit_code()
}

/// Send a [`Handshake::Error`] without a runtime and return the exit code
fn report_bootstrap_failure(stream: StdUnixStream, err: &EngineError) -> i32 {
    error!("Worker bootstrap failed: {}", err);
    let description = describe_failure("worker bootstrap failed", &err.to_string());
    let _ = stream.set_nonblocking(false);
    let mut channel = BlockingChannel::new(stream, DEFAULT_MAX_FRAME_BYTES);
    if let Err(e) = channel.send(&Handshake::Error { description }) {
        warn!("Could not report bootstrap failure: {}", e);
    }
    BOOTSTRAP_FAILURE_CODE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::spaces::{Action, BoxSpace, Dtype, Observation, Space, Tensor};
    use crate::env::{Info, Options, StepResult};
    use crate::runtime::factory::Kwargs;
    use tokio::io::{duplex, DuplexStream};

    /// Counter environment: observation is the number of steps taken.
    /// Panics on a step action of 99 and errors on 42.
    struct Counter {
        space: Space,
        steps: i32,
    }

    impl Environment for Counter {
        fn observation_space(&self) -> &Space {
            &self.space
        }

        fn action_space(&self) -> &Space {
            &self.space
        }

        fn reset(&mut self, seed: Option<i64>, _options: Option<Options>) -> Result<(Observation, Info)> {
            self.steps = seed.unwrap_or(0) as i32;
            Ok((self.observation(), Info::new()))
        }

        fn step(&mut self, action: &Action) -> Result<StepResult> {
            let value = match action {
                Action::Array(t) => t.as_i32().and_then(|v| v.first().copied()).unwrap_or(0),
                Action::Discrete(i) => *i as i32,
            };
            if value == 99 {
                panic!("counter exploded");
            }
            if value == 42 {
                return Err(EngineError::Engine("unlucky action".to_string()));
            }
            self.steps += 1;
            Ok(StepResult {
                observation: self.observation(),
                reward: 1.0,
                terminated: false,
                truncated: false,
                info: Info::new(),
            })
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    impl Counter {
        fn observation(&self) -> Observation {
            Observation::Array(Tensor::vector_i32(vec![self.steps]))
        }
    }

    fn entry_points() -> EntryPoints {
        let mut entry_points = EntryPoints::new();
        entry_points.insert("test:Counter", |_| {
            Ok(Box::new(Counter {
                space: Space::Box(BoxSpace::uniform(0.0, 100.0, vec![1], Dtype::I32)),
                steps: 0,
            }) as Box<dyn Environment>)
        });
        entry_points.insert("test:Broken", |_| Err(EngineError::Engine("no such level".to_string())));
        entry_points.insert("test:Panics", |_| panic!("factory exploded"));
        entry_points
    }

    fn start(entry_point: &str) -> (Channel<DuplexStream>, tokio::task::JoinHandle<WorkerExit>) {
        let (supervisor_end, worker_end) = duplex(64 * 1024);
        let factory = EnvFactory::new(entry_point, Kwargs::new());
        let worker = tokio::spawn(async move {
            serve(worker_end, &factory, &entry_points(), DEFAULT_MAX_FRAME_BYTES).await
        });
        (Channel::new(supervisor_end, DEFAULT_MAX_FRAME_BYTES), worker)
    }

    #[tokio::test]
    async fn test_handshake_and_close() {
        let (mut channel, worker) = start("test:Counter");
        let handshake: Handshake = channel.recv().await.unwrap().unwrap();
        assert!(matches!(handshake, Handshake::Spaces { .. }));

        channel.send(&Command::Close).await.unwrap();
        let reply: Reply = channel.recv().await.unwrap().unwrap();
        assert_eq!(reply, Reply::Ok(Payload::Ack));
        assert_eq!(worker.await.unwrap(), WorkerExit::Closed);

        // Worker dropped its end
        assert!(channel.recv::<Reply>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset_and_step_replies() {
        let (mut channel, worker) = start("test:Counter");
        let _: Handshake = channel.recv().await.unwrap().unwrap();

        channel
            .send(&Command::Reset {
                seed: Some(5),
                options: None,
            })
            .await
            .unwrap();
        match channel.recv::<Reply>().await.unwrap().unwrap() {
            Reply::Ok(Payload::Reset { observation, info }) => {
                assert_eq!(observation, Observation::Array(Tensor::vector_i32(vec![5])));
                assert!(info.is_empty());
            }
            other => panic!("unexpected reply {:?}", other),
        }

        channel.send(&Command::Step(Action::from_i32(vec![1]))).await.unwrap();
        match channel.recv::<Reply>().await.unwrap().unwrap() {
            Reply::Ok(Payload::Step(result)) => {
                assert_eq!(result.observation, Observation::Array(Tensor::vector_i32(vec![6])));
                assert_eq!(result.reward, 1.0);
            }
            other => panic!("unexpected reply {:?}", other),
        }

        drop(channel);
        assert_eq!(worker.await.unwrap(), WorkerExit::PeerGone);
    }

    #[tokio::test]
    async fn test_construction_failure_reported() {
        let (mut channel, worker) = start("test:Broken");
        match channel.recv::<Handshake>().await.unwrap().unwrap() {
            Handshake::Error { description } => {
                assert!(description.contains("no such level"));
                assert!(description.contains("backtrace"));
            }
            other => panic!("unexpected handshake {:?}", other),
        }
        assert_eq!(worker.await.unwrap(), WorkerExit::ConstructionFailed);
    }

    #[tokio::test]
    async fn test_factory_panic_reported() {
        let (mut channel, worker) = start("test:Panics");
        match channel.recv::<Handshake>().await.unwrap().unwrap() {
            Handshake::Error { description } => assert!(description.contains("factory exploded")),
            other => panic!("unexpected handshake {:?}", other),
        }
        assert_eq!(worker.await.unwrap(), WorkerExit::ConstructionFailed);
    }

    #[tokio::test]
    async fn test_step_error_ends_loop() {
        let (mut channel, worker) = start("test:Counter");
        let _: Handshake = channel.recv().await.unwrap().unwrap();

        channel.send(&Command::Step(Action::from_i32(vec![42]))).await.unwrap();
        match channel.recv::<Reply>().await.unwrap().unwrap() {
            Reply::Error { description } => assert!(description.contains("unlucky action")),
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(worker.await.unwrap(), WorkerExit::Faulted);
        assert!(channel.recv::<Reply>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_step_panic_reported() {
        let (mut channel, worker) = start("test:Counter");
        let _: Handshake = channel.recv().await.unwrap().unwrap();

        channel.send(&Command::Step(Action::from_i32(vec![99]))).await.unwrap();
        match channel.recv::<Reply>().await.unwrap().unwrap() {
            Reply::Error { description } => {
                assert!(description.starts_with("step failed: panic: counter exploded"))
            }
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(worker.await.unwrap(), WorkerExit::Faulted);
    }

    #[tokio::test]
    async fn test_unknown_command_is_fatal() {
        let (mut channel, worker) = start("test:Counter");
        let _: Handshake = channel.recv().await.unwrap().unwrap();

        channel.send(&"render").await.unwrap();
        match channel.recv::<Reply>().await.unwrap().unwrap() {
            Reply::Error { description } => assert!(description.contains("protocol violation")),
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(worker.await.unwrap(), WorkerExit::ProtocolViolation);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(WorkerExit::Closed.exit_code(), 0);
        assert_eq!(WorkerExit::PeerGone.exit_code(), 0);
        assert_ne!(WorkerExit::Faulted.exit_code(), 0);
        assert_ne!(WorkerExit::ConstructionFailed.exit_code(), 0);
    }

    fn blocking_pair() -> (BlockingChannel<StdUnixStream>, StdUnixStream) {
        let (supervisor_end, worker_end) = StdUnixStream::pair().unwrap();
        (BlockingChannel::new(supervisor_end, DEFAULT_MAX_FRAME_BYTES), worker_end)
    }

    #[test]
    fn test_blocking_serve_round_trip() {
        let (mut channel, worker_end) = blocking_pair();
        let worker = std::thread::spawn(move || {
            let factory = EnvFactory::new("test:Counter", Kwargs::new());
            serve_blocking(worker_end, &factory, &entry_points(), DEFAULT_MAX_FRAME_BYTES)
        });

        assert!(matches!(channel.recv::<Handshake>().unwrap(), Some(Handshake::Spaces { .. })));

        channel
            .send(&Command::Reset {
                seed: Some(2),
                options: None,
            })
            .unwrap();
        assert!(matches!(
            channel.recv::<Reply>().unwrap(),
            Some(Reply::Ok(Payload::Reset { .. }))
        ));

        channel.send(&Command::Step(Action::from_i32(vec![1]))).unwrap();
        match channel.recv::<Reply>().unwrap() {
            Some(Reply::Ok(Payload::Step(result))) => {
                assert_eq!(result.observation, Observation::Array(Tensor::vector_i32(vec![3])))
            }
            other => panic!("unexpected reply {:?}", other),
        }

        channel.send(&Command::Close).unwrap();
        assert_eq!(channel.recv::<Reply>().unwrap(), Some(Reply::Ok(Payload::Ack)));
        assert_eq!(worker.join().unwrap(), WorkerExit::Closed);
        assert!(channel.recv::<Reply>().unwrap().is_none());
    }

    #[test]
    fn test_blocking_serve_reports_failures() {
        let (mut channel, worker_end) = blocking_pair();
        let worker = std::thread::spawn(move || {
            let factory = EnvFactory::new("test:Counter", Kwargs::new());
            serve_blocking(worker_end, &factory, &entry_points(), DEFAULT_MAX_FRAME_BYTES)
        });
        let _: Option<Handshake> = channel.recv().unwrap();

        channel.send(&Command::Step(Action::from_i32(vec![42]))).unwrap();
        match channel.recv::<Reply>().unwrap() {
            Some(Reply::Error { description }) => assert!(description.contains("unlucky action")),
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(worker.join().unwrap(), WorkerExit::Faulted);
    }

    #[test]
    fn test_blocking_serve_construction_failure() {
        let (mut channel, worker_end) = blocking_pair();
        let factory = EnvFactory::new("test:Broken", Kwargs::new());
        let exit = serve_blocking(worker_end, &factory, &entry_points(), DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(exit, WorkerExit::ConstructionFailed);
        match channel.recv::<Handshake>().unwrap() {
            Some(Handshake::Error { description }) => assert!(description.contains("no such level")),
            other => panic!("unexpected handshake {:?}", other),
        }
    }

    #[test]
    fn test_unreadable_bootstrap_is_reported() {
        let (mut channel, worker_end) = blocking_pair();
        let bootstrap = WorkerBootstrap::from_json("{\"factory\": 7}");
        assert!(bootstrap.is_err());

        let code = serve_inherited(worker_end, bootstrap, &entry_points());
        assert_eq!(code, BOOTSTRAP_FAILURE_CODE);
        match channel.recv::<Handshake>().unwrap() {
            Some(Handshake::Error { description }) => {
                assert!(description.starts_with("worker bootstrap failed"), "{}", description)
            }
            other => panic!("unexpected handshake {:?}", other),
        }
    }

    #[test]
    fn test_rejected_bootstrap_is_reported() {
        let (mut channel, worker_end) = blocking_pair();
        let bootstrap = WorkerBootstrap {
            env_id: None,
            factory: EnvFactory::new("test:Counter", Kwargs::new()),
            max_frame_bytes: 8,
        };

        let code = serve_inherited(worker_end, Ok(bootstrap), &entry_points());
        assert_eq!(code, BOOTSTRAP_FAILURE_CODE);
        match channel.recv::<Handshake>().unwrap() {
            Some(Handshake::Error { description }) => assert!(description.contains("max_frame_bytes")),
            other => panic!("unexpected handshake {:?}", other),
        }
    }

    #[test]
    fn test_inherited_socket_registers_env_id() {
        let (mut channel, worker_end) = blocking_pair();
        let bootstrap = WorkerBootstrap {
            env_id: Some("labgym-test/inherited-v0".to_string()),
            factory: EnvFactory::new("test:Counter", Kwargs::new()),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        };
        let worker =
            std::thread::spawn(move || serve_inherited(worker_end, Ok(bootstrap), &entry_points()));

        assert!(matches!(channel.recv::<Handshake>().unwrap(), Some(Handshake::Spaces { .. })));
        assert!(registry::is_registered("labgym-test/inherited-v0"));
        channel.send(&Command::Close).unwrap();
        assert_eq!(channel.recv::<Reply>().unwrap(), Some(Reply::Ok(Payload::Ack)));
        assert_eq!(worker.join().unwrap(), 0);
    }
}
