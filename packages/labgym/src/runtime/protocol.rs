// packages/labgym/src/runtime/protocol.rs
//! Wire protocol between the supervisor and its worker
//!
//! Messages are MessagePack (`rmp-serde`, named fields) inside
//! length-delimited frames. Enums are externally tagged with snake_case
//! names, so a `close` command is the bare string `"close"` and a reset is
//! `{"reset": {"seed": .., "options": ..}}`.
//!
//! ```text
//! worker     ──▶ Handshake::Spaces | Handshake::Error       (once)
//! supervisor ──▶ Command::Reset | Command::Step | Command::Close
//! worker     ──▶ Reply::Ok(payload) | Reply::Error           (one per command)
//! ```
//!
//! Requests are strictly sequential per channel, so no request ids are
//! carried.

use crate::env::spaces::{Action, Observation, Space};
use crate::env::{Info, Options, StepResult};
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

/// Largest frame accepted unless configured otherwise
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// First message the worker sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Handshake {
    /// Environment constructed
    Spaces {
        observation_space: Space,
        action_space: Space,
    },
    /// Construction failed; the worker exits after sending this
    Error { description: String },
}

/// Supervisor → worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Reset {
        seed: Option<i64>,
        options: Option<Options>,
    },
    Step(Action),
    Close,
}

impl Command {
    /// Operation name used in errors and logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::Reset { .. } => "reset",
            Command::Step(_) => "step",
            Command::Close => "close",
        }
    }
}

/// Worker → supervisor, one per command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ok(Payload),
    Error { description: String },
}

/// Successful result of a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Reset { observation: Observation, info: Info },
    Step(StepResult),
    /// Acknowledges `close`
    Ack,
}

impl Payload {
    pub fn name(&self) -> &'static str {
        match self {
            Payload::Reset { .. } => "reset",
            Payload::Step(_) => "step",
            Payload::Ack => "ack",
        }
    }
}

/// Framed, typed duplex connection
pub struct Channel<T> {
    framed: Framed<T, LengthDelimitedCodec>,
}

impl<T> Channel<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: T, max_frame_bytes: usize) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_bytes)
            .new_codec();
        Self {
            framed: Framed::new(io, codec),
        }
    }

    /// Encode and send one message
    pub async fn send<M: Serialize>(&mut self, message: &M) -> Result<()> {
        let encoded = rmp_serde::to_vec_named(message)
            .map_err(|e| EngineError::Protocol(format!("failed to encode message: {}", e)))?;
        debug!("Sending frame of {} bytes", encoded.len());

        self.framed
            .send(Bytes::from(encoded))
            .await
            .map_err(|e| EngineError::Transport(format!("send failed: {}", e)))
    }

    /// Receive one message. `Ok(None)` means the peer closed its end.
    pub async fn recv<M: DeserializeOwned>(&mut self) -> Result<Option<M>> {
        match self.framed.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(EngineError::Transport(format!("receive failed: {}", e))),
            Some(Ok(frame)) => {
                debug!("Received frame of {} bytes", frame.len());
                rmp_serde::from_slice(&frame)
                    .map(Some)
                    .map_err(|e| EngineError::Protocol(format!("failed to decode message: {}", e)))
            }
        }
    }

    /// Send raw bytes as one frame, bypassing encoding
    #[cfg(test)]
    pub async fn send_raw(&mut self, frame: Bytes) -> Result<()> {
        self.framed
            .send(frame)
            .await
            .map_err(|e| EngineError::Transport(format!("send failed: {}", e)))
    }
}

/// Blocking counterpart of [`Channel`] with the same framing: a 4-byte
/// big-endian length, then the MessagePack body.
///
/// Used where no tokio runtime may be built, such as a forked worker or a
/// worker reporting that its runtime could not start.
pub struct BlockingChannel<T> {
    io: T,
    max_frame_bytes: usize,
}

impl<T: Read + Write> BlockingChannel<T> {
    pub fn new(io: T, max_frame_bytes: usize) -> Self {
        Self { io, max_frame_bytes }
    }

    pub fn send<M: Serialize>(&mut self, message: &M) -> Result<()> {
        let encoded = rmp_serde::to_vec_named(message)
            .map_err(|e| EngineError::Protocol(format!("failed to encode message: {}", e)))?;
        if encoded.len() > self.max_frame_bytes {
            return Err(EngineError::Transport(format!(
                "send failed: frame of {} bytes exceeds limit of {}",
                encoded.len(),
                self.max_frame_bytes
            )));
        }
        let length = u32::try_from(encoded.len())
            .map_err(|_| EngineError::Transport(format!("send failed: frame of {} bytes", encoded.len())))?;
        debug!("Sending frame of {} bytes", encoded.len());

        self.io
            .write_all(&length.to_be_bytes())
            .and_then(|()| self.io.write_all(&encoded))
            .and_then(|()| self.io.flush())
            .map_err(|e| EngineError::Transport(format!("send failed: {}", e)))
    }

    /// Receive one message. `Ok(None)` means the peer closed its end
    /// between frames.
    pub fn recv<M: DeserializeOwned>(&mut self) -> Result<Option<M>> {
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            match self.io.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(EngineError::Transport(
                        "receive failed: connection closed inside a frame header".to_string(),
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(EngineError::Transport(format!("receive failed: {}", e))),
            }
        }

        let length = u32::from_be_bytes(header) as usize;
        if length > self.max_frame_bytes {
            return Err(EngineError::Transport(format!(
                "receive failed: frame of {} bytes exceeds limit of {}",
                length, self.max_frame_bytes
            )));
        }
        let mut frame = vec![0u8; length];
        self.io
            .read_exact(&mut frame)
            .map_err(|e| EngineError::Transport(format!("receive failed: {}", e)))?;
        debug!("Received frame of {} bytes", length);

        rmp_serde::from_slice(&frame)
            .map(Some)
            .map_err(|e| EngineError::Protocol(format!("failed to decode message: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::spaces::{BoxSpace, Dtype, Tensor};
    use tokio::io::duplex;

    fn pair() -> (Channel<tokio::io::DuplexStream>, Channel<tokio::io::DuplexStream>) {
        let (a, b) = duplex(64 * 1024);
        (
            Channel::new(a, DEFAULT_MAX_FRAME_BYTES),
            Channel::new(b, DEFAULT_MAX_FRAME_BYTES),
        )
    }

    #[tokio::test]
    async fn test_command_exchange() {
        let (mut supervisor, mut worker) = pair();

        let commands = vec![
            Command::Reset {
                seed: Some(7),
                options: None,
            },
            Command::Step(Action::from_i32(vec![0, 0, 0, 1, 0, 0, 0])),
            Command::Close,
        ];
        for command in &commands {
            supervisor.send(command).await.unwrap();
        }
        for expected in &commands {
            let received: Command = worker.recv().await.unwrap().unwrap();
            assert_eq!(&received, expected);
        }
    }

    #[tokio::test]
    async fn test_handshake_carries_spaces() {
        let (mut supervisor, mut worker) = pair();
        let handshake = Handshake::Spaces {
            observation_space: Space::Box(BoxSpace::uniform(0.0, 255.0, vec![4, 4, 3], Dtype::U8)),
            action_space: Space::Discrete { n: 9 },
        };
        worker.send(&handshake).await.unwrap();
        let received: Handshake = supervisor.recv().await.unwrap().unwrap();
        assert_eq!(received, handshake);
    }

    #[tokio::test]
    async fn test_step_reply() {
        let (mut supervisor, mut worker) = pair();
        let mut info = Info::new();
        info.insert("lives".to_string(), serde_json::json!(3));
        let reply = Reply::Ok(Payload::Step(StepResult {
            observation: Observation::Array(Tensor::from_f64(vec![3], vec![1.5, -2.0, 0.0]).unwrap()),
            reward: 10.0,
            terminated: false,
            truncated: true,
            info,
        }));
        worker.send(&reply).await.unwrap();
        let received: Reply = supervisor.recv().await.unwrap().unwrap();
        assert_eq!(received, reply);
    }

    #[tokio::test]
    async fn test_eof_is_none() {
        let (supervisor, mut worker) = pair();
        drop(supervisor);
        let received: Option<Command> = worker.recv().await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_garbage_is_protocol_error() {
        let (mut supervisor, mut worker) = pair();
        supervisor.send_raw(Bytes::from_static(&[0xc1, 0xc1])).await.unwrap();
        let result: Result<Option<Command>> = worker.recv().await;
        assert!(matches!(result, Err(EngineError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_unknown_tag_is_protocol_error() {
        let (mut supervisor, mut worker) = pair();
        supervisor.send(&"render").await.unwrap();
        let result: Result<Option<Command>> = worker.recv().await;
        assert!(matches!(result, Err(EngineError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (a, b) = duplex(64 * 1024);
        let mut sender = Channel::new(a, DEFAULT_MAX_FRAME_BYTES);
        let mut receiver = Channel::new(b, 1024);
        let big = Command::Step(Action::from_i32(vec![1; 4096]));

        let send = tokio::spawn(async move {
            let _ = sender.send(&big).await;
            sender
        });
        let result: Result<Option<Command>> = receiver.recv().await;
        assert!(result.is_err());
        drop(send.await.unwrap());
    }

    #[tokio::test]
    async fn test_blocking_and_async_framing_agree() {
        let (std_end, tokio_end) = std::os::unix::net::UnixStream::pair().unwrap();
        tokio_end.set_nonblocking(true).unwrap();
        let mut async_side = Channel::new(
            tokio::net::UnixStream::from_std(tokio_end).unwrap(),
            DEFAULT_MAX_FRAME_BYTES,
        );

        let blocking = std::thread::spawn(move || {
            let mut channel = BlockingChannel::new(std_end, DEFAULT_MAX_FRAME_BYTES);
            let command: Command = channel.recv().unwrap().unwrap();
            channel.send(&Reply::Ok(Payload::Ack)).unwrap();
            command
        });

        async_side.send(&Command::Close).await.unwrap();
        let reply: Reply = async_side.recv().await.unwrap().unwrap();
        assert_eq!(reply, Reply::Ok(Payload::Ack));
        assert_eq!(blocking.join().unwrap(), Command::Close);
    }

    #[test]
    fn test_blocking_eof_and_truncation() {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        drop(a);
        let mut channel = BlockingChannel::new(b, DEFAULT_MAX_FRAME_BYTES);
        assert!(channel.recv::<Command>().unwrap().is_none());

        let (mut a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        a.write_all(&[0, 0]).unwrap();
        drop(a);
        let mut channel = BlockingChannel::new(b, DEFAULT_MAX_FRAME_BYTES);
        assert!(matches!(channel.recv::<Command>(), Err(EngineError::Transport(_))));
    }

    #[test]
    fn test_blocking_frame_limit() {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut sender = BlockingChannel::new(a, 16);
        let big = Command::Step(Action::from_i32(vec![1; 64]));
        assert!(matches!(sender.send(&big), Err(EngineError::Transport(_))));

        let mut raw = sender.io;
        raw.write_all(&(1024u32).to_be_bytes()).unwrap();
        let mut receiver = BlockingChannel::new(b, 16);
        assert!(matches!(receiver.recv::<Command>(), Err(EngineError::Transport(_))));
    }
}
