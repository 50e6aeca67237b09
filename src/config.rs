//! Gateway configuration parsing, validation, and credential loading.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use crate::{AppError, Result};

/// Keychain service name used for the shared API key.
pub const KEYCHAIN_SERVICE: &str = "agent-gateway";

/// Environment variable consulted when the keychain has no API key.
pub const API_KEY_ENV: &str = "AGENT_GATEWAY_API_KEY";

/// Identifier of the built-in process runner.
pub const DEFAULT_RUNNER_ID: &str = "process";

/// Network listeners and local IPC naming.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    /// Address the streaming listener binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port for the management HTTP surface (bound on loopback).
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Full management HTTP address; overrides the loopback default.
    #[serde(default)]
    pub http_bind: Option<String>,
    /// Named pipe / Unix socket identifier for `agent-gateway-ctl`.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
}

fn default_bind_address() -> String {
    "0.0.0.0:7420".into()
}

fn default_http_port() -> u16 {
    7421
}

fn default_ipc_name() -> String {
    "agent-gateway".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            http_port: default_http_port(),
            http_bind: None,
            ipc_name: default_ipc_name(),
        }
    }
}

/// Shared-key authentication settings.
///
/// The key itself is loaded at runtime via OS keychain or environment
/// variable, never from the TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AuthConfig {
    /// Whether loopback peers may connect without presenting the key.
    #[serde(default = "default_true")]
    pub allow_loopback_without_key: bool,
    /// Shared API key (populated at runtime).
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allow_loopback_without_key: true,
            api_key: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Per-peer rate limits and DoS escalation thresholds.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GuardLimits {
    /// Sliding window for connection attempts.
    #[serde(default = "default_attempt_window")]
    pub connection_attempt_window_seconds: u64,
    /// Attempts allowed inside one attempt window.
    #[serde(default = "default_max_attempts")]
    pub max_connection_attempts_per_window: u32,
    /// Simultaneous open connections allowed per peer.
    #[serde(default = "default_max_connections_per_peer")]
    pub max_concurrent_connections_per_peer: u32,
    /// Sliding window for in-session client messages.
    #[serde(default = "default_message_window")]
    pub client_message_window_seconds: u64,
    /// Messages allowed inside one message window.
    #[serde(default = "default_max_messages")]
    pub max_client_messages_per_window: u32,
    /// Attempt-window violations before a temporary block.
    #[serde(default = "default_violation_threshold")]
    pub dos_violation_threshold: u32,
    /// Length of a temporary block.
    #[serde(default = "default_block_seconds")]
    pub dos_block_seconds: u64,
    /// Maximum retained connection-history entries.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_attempt_window() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    30
}

fn default_max_connections_per_peer() -> u32 {
    4
}

fn default_message_window() -> u64 {
    10
}

fn default_max_messages() -> u32 {
    50
}

fn default_violation_threshold() -> u32 {
    5
}

fn default_block_seconds() -> u64 {
    300
}

fn default_history_capacity() -> usize {
    500
}

impl Default for GuardLimits {
    fn default() -> Self {
        Self {
            connection_attempt_window_seconds: default_attempt_window(),
            max_connection_attempts_per_window: default_max_attempts(),
            max_concurrent_connections_per_peer: default_max_connections_per_peer(),
            client_message_window_seconds: default_message_window(),
            max_client_messages_per_window: default_max_messages(),
            dos_violation_threshold: default_violation_threshold(),
            dos_block_seconds: default_block_seconds(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl GuardLimits {
    /// Validate that every window and limit is non-zero.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, u64); 8] = [
            (
                "connection_attempt_window_seconds",
                self.connection_attempt_window_seconds,
            ),
            (
                "max_connection_attempts_per_window",
                u64::from(self.max_connection_attempts_per_window),
            ),
            (
                "max_concurrent_connections_per_peer",
                u64::from(self.max_concurrent_connections_per_peer),
            ),
            (
                "client_message_window_seconds",
                self.client_message_window_seconds,
            ),
            (
                "max_client_messages_per_window",
                u64::from(self.max_client_messages_per_window),
            ),
            (
                "dos_violation_threshold",
                u64::from(self.dos_violation_threshold),
            ),
            ("dos_block_seconds", self.dos_block_seconds),
            ("history_capacity", self.history_capacity as u64),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(AppError::Config(format!(
                    "guard.{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

/// Server-wide and per-agent session caps.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CapacityConfig {
    /// Maximum concurrent sessions across all agents.
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: u32,
    /// Optional per-agent caps keyed by agent id.
    #[serde(default)]
    pub agents: HashMap<String, u32>,
}

fn default_max_concurrent_sessions() -> u32 {
    8
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: default_max_concurrent_sessions(),
            agents: HashMap::new(),
        }
    }
}

impl CapacityConfig {
    /// Validate caps: all non-zero, agent caps never above the server cap.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the offending cap.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_sessions == 0 {
            return Err(AppError::Config(
                "capacity.max_concurrent_sessions must be greater than zero".into(),
            ));
        }
        for (agent, cap) in &self.agents {
            if *cap == 0 {
                return Err(AppError::Config(format!(
                    "capacity.agents.{agent} must be greater than zero"
                )));
            }
            if *cap > self.max_concurrent_sessions {
                return Err(AppError::Config(format!(
                    "capacity.agents.{agent} ({cap}) exceeds max_concurrent_sessions ({})",
                    self.max_concurrent_sessions
                )));
            }
        }
        Ok(())
    }
}

/// Default agent launch settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Runner id resolved through the runner registry.
    #[serde(default = "default_runner")]
    pub runner: String,
    /// Agent CLI binary (e.g. `claude`). `None` leaves the process runner unavailable.
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments passed to the agent CLI.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for spawned agents.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_runner() -> String {
    DEFAULT_RUNNER_ID.into()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            runner: default_runner(),
            command: None,
            args: Vec::new(),
            working_dir: None,
        }
    }
}

/// On-disk locations for logs and session data.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    /// Directory holding the structured event log.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Directory holding uploads and the ctl token.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".agent-gateway").join("logs")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".agent-gateway").join("data")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            data_dir: default_data_dir(),
        }
    }
}

/// Additional runner declared under `[runners.<id>]`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunnerConfig {
    /// Spawns a local process.
    Process {
        /// Binary to launch.
        command: String,
        /// Arguments passed to the binary.
        #[serde(default)]
        args: Vec<String>,
        /// Restrict the runner to one OS (`linux`, `macos`, `windows`).
        #[serde(default)]
        platform: Option<String>,
    },
    /// Streams turns through an OpenAI-compatible chat-completions endpoint.
    Http {
        /// Full URL of the chat-completions endpoint.
        endpoint: String,
        /// Model name sent with every request.
        model: String,
        /// Environment variable holding the bearer token, if any.
        #[serde(default)]
        api_key_env: Option<String>,
        /// Optional system prompt prepended to the conversation.
        #[serde(default)]
        system_prompt: Option<String>,
    },
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GatewayConfig {
    /// Listener settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Per-peer admission limits.
    #[serde(default)]
    pub guard: GuardLimits,
    /// Session caps.
    #[serde(default)]
    pub capacity: CapacityConfig,
    /// Default agent launch settings.
    #[serde(default)]
    pub agent: AgentConfig,
    /// Log and data directories.
    #[serde(default)]
    pub paths: PathsConfig,
    /// Additional named runners.
    #[serde(default)]
    pub runners: HashMap<String, RunnerConfig>,
}

impl GatewayConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parsed streaming listener address.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `server.bind_address` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server.bind_address.parse().map_err(|err| {
            AppError::Config(format!(
                "server.bind_address '{}' invalid: {err}",
                self.server.bind_address
            ))
        })
    }

    /// Management HTTP address: `server.http_bind` when set, otherwise
    /// `127.0.0.1:<http_port>`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `server.http_bind` is not a socket address.
    pub fn http_addr(&self) -> Result<SocketAddr> {
        match &self.server.http_bind {
            Some(bind) => bind
                .parse()
                .map_err(|err| AppError::Config(format!("server.http_bind '{bind}' invalid: {err}"))),
            None => Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, self.server.http_port))),
        }
    }

    /// Path of the structured event log file.
    #[must_use]
    pub fn event_log_path(&self) -> PathBuf {
        self.paths.log_dir.join("gateway-events.jsonl")
    }

    /// Directory where uploaded media for `session_id` is stored.
    #[must_use]
    pub fn upload_dir(&self, session_id: &str) -> PathBuf {
        self.paths.data_dir.join("uploads").join(session_id)
    }

    /// Path of the per-instance ctl auth token file.
    #[must_use]
    pub fn ctl_token_path(&self) -> PathBuf {
        self.paths.data_dir.join("ctl.token")
    }

    /// Load the shared API key from OS keychain with env-var fallback.
    ///
    /// A missing key is not an error: the gateway then only admits loopback
    /// peers (when the bypass is enabled) and logs a warning.
    pub async fn load_credentials(&mut self) {
        self.auth.api_key = load_api_key().await;
        if self.auth.api_key.is_none() {
            warn!(
                service = KEYCHAIN_SERVICE,
                env = API_KEY_ENV,
                "no API key configured; only loopback clients can connect"
            );
        } else {
            info!("API key loaded");
        }
    }

    fn validate(&self) -> Result<()> {
        self.bind_addr()?;
        self.http_addr()?;
        self.guard.validate()?;
        self.capacity.validate()?;

        if self.agent.runner.trim().is_empty() {
            return Err(AppError::Config("agent.runner must not be empty".into()));
        }
        if self.server.ipc_name.trim().is_empty() {
            return Err(AppError::Config("server.ipc_name must not be empty".into()));
        }
        for id in self.runners.keys() {
            if id.trim().is_empty() {
                return Err(AppError::Config("runner ids must not be empty".into()));
            }
        }

        Ok(())
    }
}

/// Load the API key from the keychain, then the environment.
async fn load_api_key() -> Option<String> {
    let keychain_result = tokio::task::spawn_blocking(|| {
        keyring::Entry::new(KEYCHAIN_SERVICE, "api_key").and_then(|entry| entry.get_password())
    })
    .await;

    match keychain_result {
        Ok(Ok(value)) if !value.is_empty() => return Some(value),
        Ok(Ok(_)) => {
            warn!("keychain API key entry is empty, trying env var");
        }
        Ok(Err(err)) => {
            warn!(?err, "keychain lookup failed, trying env var");
        }
        Err(err) => {
            warn!(%err, "keychain task panicked, trying env var");
        }
    }

    env::var(API_KEY_ENV).ok().filter(|value| !value.is_empty())
}
