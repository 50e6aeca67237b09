//! Per-connection protocol state machine.
//!
//! One task per stream owns at most one [`ActiveSession`] at a time:
//!
//! ```text
//! Idle ──Start──▶ Starting ──spawn ok──▶ Running ──Stop / exit / disconnect──▶ Stopping ──▶ Terminated
//!                    │                                                          ▲
//!                    └──capacity / runner / spawn failure───────────────────────┘
//! ```
//!
//! After `Terminated` the stream returns to idle and may start again.

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frames::{file_transfer_chunks, ClientFrame, ClientPayload, EventKind, ServerPayload};
use super::media::{media_upload_line, script_request_line, store_upload, text_line};
use super::writer::{spawn_frame_writer, FrameSender};
use super::GatewayServices;
use crate::capacity::SessionHandle;
use crate::codec::LineCodec;
use crate::eventlog::{EventType, LogLevel, LogRecord};
use crate::models::session::{ConnectionMode, Session, SessionStatus};
use crate::runner::{AgentSession, RunnerSignal, SessionExit, SessionStreams, StartRequest};
use crate::AppError;

/// How long a client that must authenticate has to send its `auth` frame.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// How long teardown waits for pumps to flush remaining agent output.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long the connection waits for queued frames to reach the socket.
pub const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

const COMPONENT: &str = "gateway";

/// Why a running session is being torn down.
#[derive(Debug)]
enum Teardown {
    /// Client sent `stop`.
    ClientStop,
    /// Stream closed or failed without `stop`.
    Disconnect(String),
    /// Operator terminated the session through management.
    Terminated,
    /// Agent finished on its own.
    Exited(SessionExit),
    /// Gateway shutting down.
    Shutdown,
    /// Peer was banned mid-session.
    Banned,
}

/// A running agent session and its pumps.
struct ActiveSession {
    session: Session,
    agent: AgentSession,
    terminate: CancellationToken,
    pumps: Vec<JoinHandle<()>>,
}

/// What the main loop observed.
enum Step {
    Frame(ClientFrame),
    BadFrame(String),
    Closed(String),
    AgentExited(SessionExit),
    TerminateRequested,
    Shutdown,
}

struct Connection<'a> {
    services: &'a GatewayServices,
    peer: String,
    frames: FrameSender,
    correlation: watch::Sender<Option<String>>,
    active: Option<ActiveSession>,
    last_correlation: Option<String>,
}

/// Drive one stream from admission to close.
pub(crate) async fn run<S>(
    services: &GatewayServices,
    stream: S,
    peer: String,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (frames, correlation, writer) = spawn_frame_writer(write_half, peer.clone());

    let decision = services.guard.try_open_connection(&peer, "stream");
    if !decision.allowed {
        let reason = decision
            .denied_reason
            .unwrap_or_else(|| "connection refused".into());
        services.events.write(
            LogRecord::new(
                LogLevel::Warning,
                EventType::ConnectionDenied,
                format!("connection from {} denied: {reason}", decision.peer),
                "guard",
            )
            .with_details(&json!({ "peer": decision.peer, "reason": reason })),
        );
        frames.event(EventKind::Denied, reason, None).await;
        finish_writer(frames, writer).await;
        return;
    }

    services.events.write(
        LogRecord::new(
            LogLevel::Info,
            EventType::ConnectionOpened,
            format!("connection opened from {}", decision.peer),
            "guard",
        )
        .with_details(&json!({ "peer": decision.peer })),
    );

    let mut reader = FramedRead::new(read_half, LineCodec::frames());
    let mut conn = Connection {
        services,
        peer: peer.clone(),
        frames,
        correlation,
        active: None,
        last_correlation: None,
    };

    let close_reason = match conn.authenticate(&mut reader, &cancel).await {
        Ok(()) => {
            conn.frames
                .event(EventKind::Ready, "connection ready", None)
                .await;
            conn.serve(&mut reader, &cancel).await
        }
        Err(reason) => {
            conn.frames
                .event(EventKind::Denied, reason.clone(), None)
                .await;
            reason
        }
    };

    services.guard.close_connection(&peer);
    services.events.write(
        LogRecord::new(
            LogLevel::Info,
            EventType::ConnectionClosed,
            format!("connection from {} closed: {close_reason}", decision.peer),
            "guard",
        )
        .with_details(&json!({ "peer": decision.peer })),
    );
    debug!(peer, close_reason, "connection finished");

    let Connection { frames, .. } = conn;
    finish_writer(frames, writer).await;
}

async fn finish_writer(frames: FrameSender, writer: JoinHandle<()>) {
    drop(frames);
    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
        debug!("outbound writer did not drain in time");
    }
}

impl Connection<'_> {
    // ── Admission ────────────────────────────────────────────────────────────

    async fn authenticate<R>(
        &mut self,
        reader: &mut FramedRead<R, LineCodec>,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), String>
    where
        R: AsyncRead + Unpin,
    {
        let auth = &self.services.auth;
        if !auth.requires_key(&self.peer) {
            return Ok(());
        }
        if !auth.has_key() {
            return Err("remote clients require an API key, none is configured".into());
        }

        let first = tokio::select! {
            () = cancel.cancelled() => return Err("gateway shutting down".into()),
            next = tokio::time::timeout(AUTH_TIMEOUT, reader.next()) => next,
        };
        let line = match first {
            Err(_) => return Err("authentication timed out".into()),
            Ok(None) => return Err("stream closed before authentication".into()),
            Ok(Some(Err(err))) => return Err(format!("stream error before authentication: {err}")),
            Ok(Some(Ok(line))) => line,
        };

        match serde_json::from_str::<ClientFrame>(&line) {
            Ok(ClientFrame {
                payload: ClientPayload::Auth { api_key },
                ..
            }) if auth.verify(&api_key) => Ok(()),
            Ok(ClientFrame {
                payload: ClientPayload::Auth { .. },
                ..
            }) => {
                warn!(peer = self.peer, "invalid API key presented");
                Err("invalid API key".into())
            }
            _ => Err("authentication required".into()),
        }
    }

    // ── Main loop ────────────────────────────────────────────────────────────

    async fn serve<R>(
        &mut self,
        reader: &mut FramedRead<R, LineCodec>,
        cancel: &CancellationToken,
    ) -> String
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let step = tokio::select! {
                biased;

                () = cancel.cancelled() => Step::Shutdown,
                () = wait_terminate(self.active.as_ref()) => Step::TerminateRequested,
                exit = wait_agent_exit(self.active.as_ref()) => Step::AgentExited(exit),
                next = reader.next() => match next {
                    None => Step::Closed("client disconnected".into()),
                    Some(Ok(line)) => match serde_json::from_str::<ClientFrame>(&line) {
                        Ok(frame) => Step::Frame(frame),
                        Err(err) => Step::BadFrame(format!("invalid frame: {err}")),
                    },
                    Some(Err(err @ AppError::Protocol(_))) => {
                        Step::Closed(format!("protocol violation: {err}"))
                    }
                    Some(Err(err)) => Step::Closed(format!("stream read failed: {err}")),
                },
            };

            match step {
                Step::Shutdown => {
                    self.teardown(Teardown::Shutdown).await;
                    return "gateway shutting down".into();
                }
                Step::TerminateRequested => self.teardown(Teardown::Terminated).await,
                Step::AgentExited(exit) => self.teardown(Teardown::Exited(exit)).await,
                Step::Closed(reason) => {
                    self.teardown(Teardown::Disconnect(reason.clone())).await;
                    return reason;
                }
                Step::BadFrame(message) => {
                    debug!(peer = self.peer, reason = %message, "rejected client frame");
                    self.frames.error(message).await;
                }
                Step::Frame(frame) => {
                    if self.services.guard.is_banned(&self.peer) {
                        self.teardown(Teardown::Banned).await;
                        self.frames
                            .event(EventKind::Denied, "peer is banned", None)
                            .await;
                        return "peer banned".into();
                    }
                    self.handle_frame(frame).await;
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: ClientFrame) {
        self.last_correlation.clone_from(&frame.correlation_id);
        self.correlation.send_replace(frame.correlation_id.clone());
        let context = frame.context;

        match frame.payload {
            ClientPayload::Auth { .. } => {
                debug!(peer = self.peer, "ignoring repeated auth frame");
            }
            ClientPayload::Start {
                session_id,
                agent_id,
                mode,
            } => {
                self.start(session_id, agent_id, mode.unwrap_or_default(), context)
                    .await;
            }
            ClientPayload::Stop => {
                if self.active.is_some() {
                    self.teardown(Teardown::ClientStop).await;
                } else {
                    self.no_session().await;
                }
            }
            ClientPayload::Text { text } => {
                if let Some(ctx) = &context {
                    if let Some(active) = self.active.as_mut() {
                        active.session.context = Some(ctx.clone());
                    }
                }
                let line = text_line(&text, context.as_deref());
                self.deliver(line).await;
            }
            ClientPayload::ScriptRequest { path, script_type } => {
                let line = script_request_line(
                    &path,
                    &script_type,
                    context.as_deref(),
                    self.last_correlation.as_deref(),
                );
                self.deliver(line).await;
            }
            ClientPayload::MediaUpload {
                data,
                content_type,
                file_name,
            } => {
                self.upload(&data, &content_type, &file_name, context.as_deref())
                    .await;
            }
        }
    }

    // ── Start ────────────────────────────────────────────────────────────────

    async fn start(
        &mut self,
        session_id: Option<String>,
        agent_id: Option<String>,
        mode: ConnectionMode,
        context: Option<String>,
    ) {
        if let Some(active) = &self.active {
            let message = format!("session '{}' is already running", active.session.id);
            let sid = active.session.id.clone();
            self.frames
                .event(EventKind::SessionError, message, Some(&sid))
                .await;
            return;
        }

        let Some(runner) = self.services.runners.resolve(agent_id.as_deref()) else {
            let mut session = Session::new(session_id, agent_id.unwrap_or_default(), mode);
            session.transition(SessionStatus::Starting);
            self.start_failed(&mut session, "no runner is registered".into())
                .await;
            return;
        };
        let agent = agent_id.unwrap_or_else(|| runner.id().to_owned());
        let mut session = Session::new(session_id, agent, mode);
        session.context = context;
        session.transition(SessionStatus::Starting);

        let terminate = CancellationToken::new();
        if let Err(reason) = self.services.capacity.try_register_session(
            &session.agent_id,
            &session.id,
            SessionHandle::new(self.peer.clone(), terminate.clone()),
        ) {
            self.start_failed(&mut session, reason).await;
            return;
        }

        let request = StartRequest {
            session_id: session.id.clone(),
            ..StartRequest::default()
        };
        let started = match runner.start(request).await {
            Ok(Some(agent)) => Ok(agent),
            Ok(None) => Err(AppError::RunnerUnavailable(format!(
                "runner '{}' cannot start on this host or has no command configured",
                runner.id()
            ))),
            Err(err) => Err(err),
        };

        let mut agent = match started {
            Ok(agent) => agent,
            Err(err) => {
                self.services
                    .capacity
                    .unregister_session(&session.agent_id, &session.id);
                self.start_failed(&mut session, err.to_string()).await;
                return;
            }
        };

        session.transition(SessionStatus::Running);
        let pumps = agent
            .take_streams()
            .map(|streams| spawn_pumps(streams, &self.frames))
            .unwrap_or_default();

        info!(
            session_id = session.id,
            agent_id = session.agent_id,
            runner = runner.id(),
            peer = self.peer,
            "session started"
        );
        self.log(
            LogRecord::new(
                LogLevel::Info,
                EventType::SessionStarted,
                format!("session started for agent '{}'", session.agent_id),
                COMPONENT,
            )
            .with_session(session.id.clone())
            .with_details(&json!({
                "agent_id": session.agent_id,
                "runner": runner.id(),
                "peer": self.peer,
                "mode": session.mode,
            })),
        );
        self.frames
            .event(
                EventKind::SessionStarted,
                format!("session started for agent '{}'", session.agent_id),
                Some(&session.id),
            )
            .await;

        self.active = Some(ActiveSession {
            session,
            agent,
            terminate,
            pumps,
        });
    }

    async fn start_failed(&mut self, session: &mut Session, reason: String) {
        session.transition(SessionStatus::Stopping);
        session.transition(SessionStatus::Terminated);
        warn!(
            session_id = session.id,
            agent_id = session.agent_id,
            reason,
            "session failed to start"
        );
        self.log(
            LogRecord::new(
                LogLevel::Error,
                EventType::SessionError,
                format!("session failed to start: {reason}"),
                COMPONENT,
            )
            .with_session(session.id.clone())
            .with_details(&json!({ "agent_id": session.agent_id, "peer": self.peer })),
        );
        self.frames
            .event(EventKind::SessionError, reason, Some(&session.id))
            .await;
    }

    // ── Client input ─────────────────────────────────────────────────────────

    /// Rate-limit and queue one line for the agent's stdin.
    ///
    /// Never waits on the agent: a full input buffer drops the line and
    /// reports a stream fault, so the loop keeps reading Stop and disconnects.
    async fn deliver(&self, line: String) {
        if self.active.is_none() {
            self.no_session().await;
            return;
        }
        if !self.admit_message().await {
            return;
        }
        let Some(active) = self.active.as_ref() else {
            return;
        };
        if let Err(err) = active.agent.try_send_input(line) {
            let sid = active.session.id.clone();
            self.stream_fault(&sid, &err.to_string()).await;
        }
    }

    async fn upload(
        &self,
        data: &str,
        content_type: &str,
        file_name: &str,
        context: Option<&str>,
    ) {
        let Some(sid) = self.active.as_ref().map(|a| a.session.id.clone()) else {
            self.no_session().await;
            return;
        };
        if !self.admit_message().await {
            return;
        }
        let stored = store_upload(&self.services.upload_root, &sid, file_name, data).await;
        let path = match stored {
            Ok(path) => path,
            Err(err) => {
                self.stream_fault(&sid, &format!("media upload failed: {err}"))
                    .await;
                return;
            }
        };
        let line = media_upload_line(
            &path,
            content_type,
            file_name,
            context,
            self.last_correlation.as_deref(),
        );
        if let Some(active) = self.active.as_ref() {
            if let Err(err) = active.agent.try_send_input(line) {
                self.stream_fault(&sid, &err.to_string()).await;
            }
        }
    }

    async fn admit_message(&self) -> bool {
        if self
            .services
            .guard
            .try_register_client_message(&self.peer, "stream")
        {
            return true;
        }
        let sid = self.active.as_ref().map(|a| a.session.id.clone());
        let mut record = LogRecord::new(
            LogLevel::Warning,
            EventType::MessageRateLimited,
            format!("message from {} dropped by rate limiter", self.peer),
            COMPONENT,
        );
        if let Some(sid) = &sid {
            record = record.with_session(sid.clone());
        }
        self.log(record);
        self.frames
            .event(
                EventKind::RateLimited,
                "message dropped: rate limit exceeded",
                sid.as_deref(),
            )
            .await;
        false
    }

    async fn stream_fault(&self, session_id: &str, message: &str) {
        warn!(session_id, peer = self.peer, error = message, "stream fault");
        self.log(
            LogRecord::new(LogLevel::Warning, EventType::StreamError, message, COMPONENT)
                .with_session(session_id),
        );
        self.frames.error(message).await;
    }

    async fn no_session(&self) {
        self.frames
            .event(EventKind::SessionError, "no active session", None)
            .await;
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    async fn teardown(&mut self, why: Teardown) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        active.session.transition(SessionStatus::Stopping);
        let sid = active.session.id.clone();
        let agent_id = active.session.agent_id.clone();

        let exit = match &why {
            Teardown::Exited(exit) => Some(exit.clone()),
            _ => active.agent.stop().await,
        };
        drain_pumps(&mut active.pumps).await;
        drop(active.agent);

        self.services.capacity.unregister_session(&agent_id, &sid);

        let (level, event_type, kind, message) = match &why {
            Teardown::ClientStop => (
                LogLevel::Info,
                EventType::SessionStopped,
                EventKind::SessionStopped,
                "session stopped by client".to_owned(),
            ),
            Teardown::Terminated => (
                LogLevel::Info,
                EventType::SessionStopped,
                EventKind::SessionStopped,
                "session terminated by operator".to_owned(),
            ),
            Teardown::Shutdown => (
                LogLevel::Info,
                EventType::SessionStopped,
                EventKind::SessionStopped,
                "session stopped: gateway shutting down".to_owned(),
            ),
            Teardown::Banned => (
                LogLevel::Warning,
                EventType::SessionStopped,
                EventKind::SessionStopped,
                "session stopped: peer banned".to_owned(),
            ),
            Teardown::Exited(exit) if exit.code == Some(0) => (
                LogLevel::Info,
                EventType::SessionStopped,
                EventKind::SessionStopped,
                format!("agent finished: {}", exit.reason),
            ),
            Teardown::Exited(exit) => (
                LogLevel::Error,
                EventType::SessionError,
                EventKind::SessionError,
                format!("agent exited unexpectedly: {}", exit.reason),
            ),
            Teardown::Disconnect(reason) => (
                LogLevel::Warning,
                EventType::SessionStopped,
                EventKind::SessionStopped,
                format!("session stopped: {reason}"),
            ),
        };

        if let Teardown::Disconnect(reason) = &why {
            self.services
                .capacity
                .mark_session_abandoned(&sid, &agent_id, reason);
            self.log(
                LogRecord::new(
                    LogLevel::Warning,
                    EventType::SessionAbandoned,
                    format!("session abandoned: {reason}"),
                    COMPONENT,
                )
                .with_session(sid.clone()),
            );
        }

        active.session.transition(SessionStatus::Terminated);
        info!(session_id = sid, agent_id, reason = %message, "session terminated");
        self.log(
            LogRecord::new(level, event_type, message.clone(), COMPONENT)
                .with_session(sid.clone())
                .with_details(&json!({
                    "agent_id": agent_id,
                    "peer": self.peer,
                    "exit_code": exit.as_ref().and_then(|e| e.code),
                })),
        );
        if !matches!(why, Teardown::Disconnect(_)) {
            self.frames.event(kind, message, Some(&sid)).await;
        }
    }

    fn log(&self, record: LogRecord) {
        self.services
            .events
            .write(record.with_correlation(self.last_correlation.as_deref()));
    }
}

// ── Select helpers ───────────────────────────────────────────────────────────

async fn wait_agent_exit(active: Option<&ActiveSession>) -> SessionExit {
    match active {
        Some(active) => active.agent.wait_exit().await,
        None => std::future::pending().await,
    }
}

async fn wait_terminate(active: Option<&ActiveSession>) {
    match active {
        Some(active) => active.terminate.cancelled().await,
        None => std::future::pending().await,
    }
}

// ── Pumps ────────────────────────────────────────────────────────────────────

fn spawn_pumps(streams: SessionStreams, frames: &FrameSender) -> Vec<JoinHandle<()>> {
    let SessionStreams {
        mut stdout,
        mut stderr,
        mut signals,
    } = streams;

    let out = frames.clone();
    let stdout_pump = tokio::spawn(async move {
        while let Some(line) = stdout.recv().await {
            if !out.output(line).await {
                break;
            }
        }
    });

    let err = frames.clone();
    let stderr_pump = tokio::spawn(async move {
        while let Some(line) = stderr.recv().await {
            if !err.error(line).await {
                break;
            }
        }
    });

    let sig = frames.clone();
    let signal_pump = tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            if !forward_signal(&sig, signal).await {
                break;
            }
        }
    });

    vec![stdout_pump, stderr_pump, signal_pump]
}

async fn forward_signal(frames: &FrameSender, signal: RunnerSignal) -> bool {
    match signal {
        RunnerSignal::Media { content_type, data } => {
            use base64::Engine as _;
            frames
                .send(ServerPayload::Media {
                    data: base64::engine::general_purpose::STANDARD.encode(data),
                    content_type,
                })
                .await
        }
        RunnerSignal::File {
            relative_path,
            data,
        } => {
            for chunk in file_transfer_chunks(&relative_path, &data) {
                if !frames.send(chunk).await {
                    return false;
                }
            }
            true
        }
    }
}

/// Let pumps flush what the agent already produced, then abort stragglers.
async fn drain_pumps(pumps: &mut Vec<JoinHandle<()>>) {
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    for pump in pumps.iter_mut() {
        if tokio::time::timeout_at(deadline, &mut *pump).await.is_err() {
            pump.abort();
        }
    }
    pumps.clear();
}
