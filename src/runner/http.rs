//! Runner backed by an OpenAI-compatible streaming chat-completions API.
//!
//! Each stdin line becomes one user turn. The response is requested with
//! `stream: true`; content deltas are buffered and flushed to stdout at every
//! newline and once more when the response ends, so clients see output as it
//! is generated. The full conversation is replayed on every request, which
//! is how the API keeps cross-turn context.

use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    output_channels, AgentSession, Runner, SessionExit, SessionOutputs, StartFuture,
    StartRequest, CHANNEL_CAPACITY,
};
use crate::{AppError, Result};

/// Connect timeout for the chat endpoint.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest error body echoed to stderr.
const MAX_ERROR_BODY: usize = 512;

/// One conversation message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    /// `system`, `user`, or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_owned(),
            content: content.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Settings for an HTTP runner.
#[derive(Debug, Clone)]
pub struct HttpRunnerConfig {
    /// Chat-completions URL.
    pub endpoint: String,
    /// Model name.
    pub model: String,
    /// Environment variable holding the bearer token.
    pub api_key_env: Option<String>,
    /// System prompt placed first in every conversation.
    pub system_prompt: Option<String>,
}

/// HTTP-backed runner.
#[derive(Debug, Clone)]
pub struct HttpRunner {
    id: String,
    config: HttpRunnerConfig,
    client: reqwest::Client,
}

impl HttpRunner {
    /// Build a runner with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be constructed.
    pub fn new(id: impl Into<String>, config: HttpRunnerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| AppError::Config(format!("http runner client: {err}")))?;
        Ok(Self {
            id: id.into(),
            config,
            client,
        })
    }

    fn open_session(&self, request: StartRequest) -> AgentSession {
        let api_key = self
            .config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty());
        if self.config.api_key_env.is_some() && api_key.is_none() {
            warn!(runner = self.id, "http runner api key variable is unset");
        }

        let cancel = CancellationToken::new();
        let (input_tx, input_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outputs, streams) = output_channels();
        let (exit_tx, exit_rx) = watch::channel(None);

        let mut history = Vec::new();
        if let Some(prompt) = &self.config.system_prompt {
            history.push(ChatMessage::new("system", prompt.clone()));
        }

        let conversation = Conversation {
            session_id: request.session_id.clone(),
            client: self.client.clone(),
            endpoint: self.config.endpoint.clone(),
            model: self.config.model.clone(),
            api_key,
            history,
            outputs,
            cancel: cancel.clone(),
        };
        tokio::spawn(conversation.run(input_rx, exit_tx));

        info!(
            session_id = request.session_id,
            runner = self.id,
            endpoint = self.config.endpoint,
            "http agent session opened"
        );
        AgentSession::new(request.session_id, input_tx, streams, exit_rx, cancel)
    }
}

impl Runner for HttpRunner {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(&self, request: StartRequest) -> StartFuture<'_> {
        Box::pin(async move { Ok(Some(self.open_session(request))) })
    }
}

/// Outcome of one streamed turn.
enum TurnEnd {
    Completed(String),
    Failed(String),
    Cancelled,
}

struct Conversation {
    session_id: String,
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    history: Vec<ChatMessage>,
    outputs: SessionOutputs,
    cancel: CancellationToken,
}

impl Conversation {
    async fn run(
        mut self,
        mut input_rx: mpsc::Receiver<String>,
        exit_tx: watch::Sender<Option<SessionExit>>,
    ) {
        let exit = loop {
            let line = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break requested_exit(),
                line = input_rx.recv() => line,
            };
            let Some(line) = line else {
                break SessionExit {
                    code: Some(0),
                    reason: "conversation input closed".into(),
                    requested: false,
                };
            };

            self.history.push(ChatMessage::new("user", line));
            match self.turn().await {
                TurnEnd::Completed(reply) => {
                    self.history.push(ChatMessage::new("assistant", reply));
                }
                TurnEnd::Failed(message) => {
                    // The unanswered user turn stays out of the history.
                    self.history.pop();
                    warn!(session_id = self.session_id, error = %message, "http turn failed");
                    if self.outputs.stderr.send(message).await.is_err() {
                        break requested_exit();
                    }
                }
                TurnEnd::Cancelled => break requested_exit(),
            }
        };
        debug!(session_id = self.session_id, reason = exit.reason, "http agent session ended");
        exit_tx.send_replace(Some(exit));
    }

    async fn turn(&self) -> TurnEnd {
        let body = ChatRequest {
            model: &self.model,
            messages: &self.history,
            stream: true,
        };
        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = tokio::select! {
            () = self.cancel.cancelled() => return TurnEnd::Cancelled,
            result = builder.send() => match result {
                Ok(response) => response,
                Err(err) => return TurnEnd::Failed(format!("http runner request failed: {err}")),
            },
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY).collect();
            return TurnEnd::Failed(format!("http runner status {status}: {body}"));
        }

        let mut events = SseAccumulator::default();
        let mut pending = String::new();
        let mut reply = String::new();
        let mut stream = std::pin::pin!(response.bytes_stream());

        loop {
            let chunk = tokio::select! {
                () = self.cancel.cancelled() => return TurnEnd::Cancelled,
                chunk = stream.next() => chunk,
            };
            let bytes = match chunk {
                None => break,
                Some(Ok(bytes)) => bytes,
                Some(Err(err)) => {
                    return TurnEnd::Failed(format!("http runner stream error: {err}"))
                }
            };

            let mut done = false;
            for payload in events.push(&bytes) {
                if payload == "[DONE]" {
                    done = true;
                    break;
                }
                let Some(delta) = delta_content(&payload) else {
                    continue;
                };
                reply.push_str(&delta);
                pending.push_str(&delta);
                if !self.flush_complete_lines(&mut pending).await {
                    return TurnEnd::Cancelled;
                }
            }
            if done {
                break;
            }
        }

        if !pending.is_empty() && self.outputs.stdout.send(pending).await.is_err() {
            return TurnEnd::Cancelled;
        }
        TurnEnd::Completed(reply)
    }

    /// Send every complete line in `pending` to stdout; `false` if the
    /// receiver is gone.
    async fn flush_complete_lines(&self, pending: &mut String) -> bool {
        while let Some(idx) = pending.find('\n') {
            let line: String = pending.drain(..=idx).collect();
            let line = line.trim_end_matches(['\r', '\n']).to_owned();
            if self.outputs.stdout.send(line).await.is_err() {
                return false;
            }
        }
        true
    }
}

fn requested_exit() -> SessionExit {
    SessionExit {
        code: None,
        reason: "stopped by gateway".into(),
        requested: true,
    }
}

fn delta_content(payload: &str) -> Option<String> {
    match serde_json::from_str::<ChatChunk>(payload) {
        Ok(chunk) => {
            let text: String = chunk
                .choices
                .into_iter()
                .filter_map(|c| c.delta.content)
                .collect();
            (!text.is_empty()).then_some(text)
        }
        Err(err) => {
            debug!(%err, "skipping unparseable stream chunk");
            None
        }
    }
}

/// Splits a server-sent-events byte stream into `data:` payloads.
#[derive(Debug, Default)]
pub struct SseAccumulator {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseAccumulator {
    /// Feed raw bytes; returns payloads of every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.strip_prefix(' ').unwrap_or(value).to_owned());
            }
        }
        events
    }
}
