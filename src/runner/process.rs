//! Runner that spawns the agent as a local child process.
//!
//! The child is launched with:
//! - `env_clear()` plus [`ALLOWED_ENV_VARS`], so gateway secrets such as the
//!   API key never reach the agent.
//! - `AGENT_GATEWAY_SESSION_ID` injected explicitly.
//! - its own process group on unix, so [`AgentSession::stop`] can take down
//!   the whole tree the agent started.
//! - `kill_on_drop(true)` as a last line of cleanup.
//!
//! Four tasks drive a session: a stdin writer fed by an mpsc channel, a
//! stdout reader (which also recognises out-of-band signal lines), a stderr
//! reader, and an exit monitor that owns the [`Child`].

use std::path::{Path, PathBuf};
use std::process::Stdio;

use base64::Engine as _;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    output_channels, platform_matches, AgentSession, Runner, RunnerSignal, SessionExit,
    SessionOutputs, StartFuture, StartRequest, CHANNEL_CAPACITY,
};
use crate::codec::LineCodec;
use crate::path_safety::validate_path;
use crate::{AppError, Result};

// ── Environment allowlist ────────────────────────────────────────────────────

/// Environment variables inherited by the spawned agent process.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "TERM",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Variable carrying the session id into the agent's environment.
pub const SESSION_ID_ENV: &str = "AGENT_GATEWAY_SESSION_ID";

/// Stdout prefix requesting delivery of a workspace file.
pub const FILE_SIGNAL_PREFIX: &str = "::file::";

/// Stdout prefix carrying inline base64 media.
pub const MEDIA_SIGNAL_PREFIX: &str = "::media::";

/// Largest file a `::file::` signal may deliver.
pub const MAX_SIGNAL_FILE_BYTES: u64 = 64 * 1024 * 1024;

// ── Runner ───────────────────────────────────────────────────────────────────

/// Process-backed runner.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    id: String,
    command: Option<String>,
    args: Vec<String>,
    platform: Option<String>,
    working_dir: Option<PathBuf>,
}

impl ProcessRunner {
    /// Create a runner. A `None` command makes it unavailable unless the
    /// start request supplies one.
    #[must_use]
    pub fn new(id: impl Into<String>, command: Option<String>, args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            command,
            args,
            platform: None,
            working_dir: None,
        }
    }

    /// Restrict the runner to one operating system.
    #[must_use]
    pub fn with_platform(mut self, platform: Option<String>) -> Self {
        self.platform = platform;
        self
    }

    /// Default working directory for spawned agents.
    #[must_use]
    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    async fn spawn_session(&self, request: StartRequest) -> Result<Option<AgentSession>> {
        if !platform_matches(self.platform.as_deref()) {
            debug!(
                runner = self.id,
                platform = ?self.platform,
                "runner platform does not match host"
            );
            return Ok(None);
        }

        let (command, args) = match request.command {
            Some(command) => (command, request.args),
            None => match &self.command {
                Some(command) => (command.clone(), self.args.clone()),
                None => return Ok(None),
            },
        };

        let working_dir = match request.working_dir.or_else(|| self.working_dir.clone()) {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };

        let mut cmd = Command::new(&command);
        cmd.args(&args);

        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.env(SESSION_ID_ENV, &request.session_id);

        cmd.current_dir(&working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Spawn(format!("failed to spawn '{command}': {err}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture agent stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture agent stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture agent stderr".into()))?;

        let session_id = request.session_id;
        info!(
            session_id,
            runner = self.id,
            command,
            pid = ?child.id(),
            "agent process spawned"
        );

        let cancel = CancellationToken::new();
        let (input_tx, input_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outputs, streams) = output_channels();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(run_stdin_writer(
            session_id.clone(),
            stdin,
            input_rx,
            cancel.clone(),
        ));
        tokio::spawn(read_stdout(
            session_id.clone(),
            stdout,
            outputs.clone(),
            working_dir,
        ));
        tokio::spawn(read_stderr(session_id.clone(), stderr, outputs));
        tokio::spawn(monitor_exit(
            session_id.clone(),
            child,
            exit_tx,
            cancel.clone(),
        ));

        Ok(Some(AgentSession::new(
            session_id, input_tx, streams, exit_rx, cancel,
        )))
    }
}

impl Runner for ProcessRunner {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(&self, request: StartRequest) -> StartFuture<'_> {
        Box::pin(self.spawn_session(request))
    }
}

// ── Tasks ────────────────────────────────────────────────────────────────────

/// Write queued lines to the agent's stdin until cancelled or the queue closes.
async fn run_stdin_writer(
    session_id: String,
    mut stdin: ChildStdin,
    mut input_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "stdin writer: cancellation received, stopping");
                break;
            }

            line = input_rx.recv() => {
                let Some(line) = line else {
                    debug!(session_id, "stdin writer: input channel closed, stopping");
                    break;
                };
                let mut bytes = line.into_bytes();
                if bytes.last() != Some(&b'\n') {
                    bytes.push(b'\n');
                }
                let written = async {
                    stdin.write_all(&bytes).await?;
                    stdin.flush().await
                }
                .await;
                if let Err(err) = written {
                    warn!(session_id, %err, "stdin writer: write failed, stopping");
                    break;
                }
            }
        }
    }
}

/// Forward stdout lines, diverting recognised signal lines.
async fn read_stdout<R>(
    session_id: String,
    stdout: R,
    outputs: SessionOutputs,
    working_dir: PathBuf,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(stdout, LineCodec::agent_output());
    while let Some(item) = lines.next().await {
        let line = match item {
            Ok(line) => line,
            Err(err) => {
                warn!(session_id, %err, "stdout read failed");
                break;
            }
        };

        match parse_signal(&line, &working_dir).await {
            Some(Ok(signal)) => {
                if outputs.signals.send(signal).await.is_err() {
                    break;
                }
            }
            Some(Err(err)) => {
                warn!(session_id, %err, "rejected agent signal");
                if outputs.stderr.send(err.to_string()).await.is_err() {
                    break;
                }
            }
            None => {
                if outputs.stdout.send(line).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!(session_id, "stdout reader finished");
}

async fn read_stderr<R>(session_id: String, stderr: R, outputs: SessionOutputs)
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(stderr, LineCodec::agent_output());
    while let Some(item) = lines.next().await {
        match item {
            Ok(line) => {
                if outputs.stderr.send(line).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(session_id, %err, "stderr read failed");
                break;
            }
        }
    }
    debug!(session_id, "stderr reader finished");
}

/// Own the child until it exits or the session is cancelled.
async fn monitor_exit(
    session_id: String,
    mut child: Child,
    exit_tx: watch::Sender<Option<SessionExit>>,
    cancel: CancellationToken,
) {
    let exit = tokio::select! {
        result = child.wait() => {
            let (code, reason) = describe_wait(result);
            info!(session_id, ?code, reason, "agent process exited");
            SessionExit { code, reason, requested: false }
        }
        () = cancel.cancelled() => {
            kill_tree(&session_id, &mut child).await;
            let (code, _) = describe_wait(child.wait().await);
            info!(session_id, "agent process stopped");
            SessionExit {
                code,
                reason: "stopped by gateway".into(),
                requested: true,
            }
        }
    };
    exit_tx.send_replace(Some(exit));
}

fn describe_wait(result: std::io::Result<std::process::ExitStatus>) -> (Option<i32>, String) {
    match result {
        Ok(status) => {
            let code = status.code();
            let reason = code.map_or_else(
                || "process terminated by signal".to_owned(),
                |c| format!("process exited with code {c}"),
            );
            (code, reason)
        }
        Err(err) => (None, format!("wait error: {err}")),
    }
}

/// Kill the child and, on unix, every process in its group.
async fn kill_tree(session_id: &str, child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            debug!(session_id, %err, "killpg failed, falling back to direct kill");
        }
    }
    if let Err(err) = child.kill().await {
        debug!(session_id, %err, "child kill returned error");
    }
}

// ── Signals ──────────────────────────────────────────────────────────────────

/// Interpret `line` as an out-of-band signal.
///
/// Returns `None` for ordinary output.
pub async fn parse_signal(line: &str, working_dir: &Path) -> Option<Result<RunnerSignal>> {
    let trimmed = line.trim_end();
    if let Some(rel) = trimmed.strip_prefix(FILE_SIGNAL_PREFIX) {
        return Some(read_signal_file(rel.trim(), working_dir).await);
    }
    if let Some(rest) = trimmed.strip_prefix(MEDIA_SIGNAL_PREFIX) {
        return Some(decode_media(rest));
    }
    None
}

async fn read_signal_file(relative: &str, working_dir: &Path) -> Result<RunnerSignal> {
    let path = validate_path(working_dir, relative)?;
    let meta = tokio::fs::metadata(&path)
        .await
        .map_err(|err| AppError::NotFound(format!("file signal '{relative}': {err}")))?;
    if !meta.is_file() {
        return Err(AppError::NotFound(format!(
            "file signal '{relative}' is not a regular file"
        )));
    }
    if meta.len() > MAX_SIGNAL_FILE_BYTES {
        return Err(AppError::Stream(format!(
            "file signal '{relative}' exceeds {MAX_SIGNAL_FILE_BYTES} bytes"
        )));
    }
    let data = tokio::fs::read(&path).await?;
    Ok(RunnerSignal::File {
        relative_path: relative.to_owned(),
        data,
    })
}

fn decode_media(rest: &str) -> Result<RunnerSignal> {
    let (content_type, encoded) = rest
        .split_once("::")
        .ok_or_else(|| AppError::Protocol("media signal missing '::' separator".into()))?;
    if content_type.trim().is_empty() {
        return Err(AppError::Protocol("media signal missing content type".into()));
    }
    let data = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|err| AppError::Protocol(format!("media signal base64 invalid: {err}")))?;
    Ok(RunnerSignal::Media {
        content_type: content_type.trim().to_owned(),
        data,
    })
}
