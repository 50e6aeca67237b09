//! Agent runner abstraction.
//!
//! A [`Runner`] knows how to start an [`AgentSession`]: a line-oriented
//! duplex conversation with an agent. The session exposes a stdin sender,
//! stdout/stderr line receivers, an out-of-band signal receiver, and an exit
//! watch. Whatever backs the session (a child process, an HTTP API) is
//! driven by tasks the runner spawns; the session owns the cancellation
//! token that tears them down.

pub mod http;
pub mod process;
pub mod registry;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{AppError, Result};

pub use registry::{RunnerFactory, RunnerRegistry};

/// How long [`AgentSession::stop`] waits for the backend to confirm exit.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the stdin, stdout, stderr, and signal channels.
pub const CHANNEL_CAPACITY: usize = 256;

/// Parameters for starting a session.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// Command override; runners fall back to their configured command.
    pub command: Option<String>,
    /// Argument override; used only together with `command`.
    pub args: Vec<String>,
    /// Session identifier exposed to the agent.
    pub session_id: String,
    /// Working directory override.
    pub working_dir: Option<PathBuf>,
}

/// Out-of-band payload produced by an agent alongside its text output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerSignal {
    /// A file the agent wants delivered to the client.
    File {
        /// Path relative to the session working directory.
        relative_path: String,
        /// File contents.
        data: Vec<u8>,
    },
    /// Inline media (images, audio) emitted by the agent.
    Media {
        /// MIME type.
        content_type: String,
        /// Raw bytes.
        data: Vec<u8>,
    },
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExit {
    /// Exit code, when the backend reports one.
    pub code: Option<i32>,
    /// Human-readable description.
    pub reason: String,
    /// Whether the exit was requested through [`AgentSession::stop`].
    pub requested: bool,
}

/// Receiving halves of a session's output channels.
#[derive(Debug)]
pub struct SessionStreams {
    /// Agent stdout, one line per message.
    pub stdout: mpsc::Receiver<String>,
    /// Agent stderr, one line per message.
    pub stderr: mpsc::Receiver<String>,
    /// Out-of-band signals.
    pub signals: mpsc::Receiver<RunnerSignal>,
}

/// Sending halves handed to the backend tasks that produce output.
#[derive(Debug, Clone)]
pub struct SessionOutputs {
    /// Agent stdout.
    pub stdout: mpsc::Sender<String>,
    /// Agent stderr.
    pub stderr: mpsc::Sender<String>,
    /// Out-of-band signals.
    pub signals: mpsc::Sender<RunnerSignal>,
}

/// Build a matched pair of output senders and receivers.
#[must_use]
pub fn output_channels() -> (SessionOutputs, SessionStreams) {
    let (stdout_tx, stdout_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (stderr_tx, stderr_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (signal_tx, signal_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        SessionOutputs {
            stdout: stdout_tx,
            stderr: stderr_tx,
            signals: signal_tx,
        },
        SessionStreams {
            stdout: stdout_rx,
            stderr: stderr_rx,
            signals: signal_rx,
        },
    )
}

/// Live conversation with an agent.
///
/// Owned by exactly one gateway task. Dropping the session cancels its
/// backend, which stops the underlying process.
#[derive(Debug)]
pub struct AgentSession {
    session_id: String,
    input: mpsc::Sender<String>,
    streams: Option<SessionStreams>,
    exit: watch::Receiver<Option<SessionExit>>,
    cancel: CancellationToken,
}

impl AgentSession {
    /// Assemble a session from the pieces a runner created.
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        input: mpsc::Sender<String>,
        streams: SessionStreams,
        exit: watch::Receiver<Option<SessionExit>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            input,
            streams: Some(streams),
            exit,
            cancel,
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Queue one line for the agent's stdin.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Stream` if the agent's input side has shut down.
    pub async fn send_input(&self, line: impl Into<String>) -> Result<()> {
        self.input
            .send(line.into())
            .await
            .map_err(|_| AppError::Stream("agent stdin closed".into()))
    }

    /// Queue one line for the agent's stdin without waiting for room.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Stream` if the input buffer is full (the line is
    /// dropped) or the agent's input side has shut down.
    pub fn try_send_input(&self, line: impl Into<String>) -> Result<()> {
        self.input.try_send(line.into()).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                AppError::Stream("agent input buffer full, message dropped".into())
            }
            mpsc::error::TrySendError::Closed(_) => AppError::Stream("agent stdin closed".into()),
        })
    }

    /// Take the output receivers. Returns `None` after the first call.
    pub fn take_streams(&mut self) -> Option<SessionStreams> {
        self.streams.take()
    }

    /// Whether the backend has finished.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Exit details, once the backend has finished.
    #[must_use]
    pub fn exit_status(&self) -> Option<SessionExit> {
        self.exit.borrow().clone()
    }

    /// Wait until the backend finishes.
    pub async fn wait_exit(&self) -> SessionExit {
        let mut rx = self.exit.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone().unwrap_or_else(lost_backend),
            Err(_) => lost_backend(),
        };
        exit
    }

    /// Forcefully stop the backend and wait (bounded) for it to exit.
    ///
    /// Safe to call any number of times, from any path.
    pub async fn stop(&self) -> Option<SessionExit> {
        self.cancel.cancel();
        if let Ok(exit) = tokio::time::timeout(STOP_TIMEOUT, self.wait_exit()).await {
            Some(exit)
        } else {
            debug!(session_id = %self.session_id, "agent did not confirm exit before timeout");
            None
        }
    }

    /// Token cancelled when the session is stopped.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn lost_backend() -> SessionExit {
    SessionExit {
        code: None,
        reason: "agent backend ended without reporting exit".into(),
        requested: false,
    }
}

/// Boxed future returned by [`Runner::start`].
pub type StartFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<AgentSession>>> + Send + 'a>>;

/// Strategy that starts agent sessions.
///
/// `Ok(None)` means the runner cannot serve the request (no command
/// configured, wrong platform) and callers report it as unavailable.
/// `Err` means the runner tried and failed.
pub trait Runner: Send + Sync {
    /// Registry identifier.
    fn id(&self) -> &str;

    /// Start a new session.
    fn start(&self, request: StartRequest) -> StartFuture<'_>;
}

/// Whether a runner restricted to `platform` may run on this host.
#[must_use]
pub fn platform_matches(platform: Option<&str>) -> bool {
    platform.is_none_or(|p| p.eq_ignore_ascii_case(std::env::consts::OS))
}
