use std::path::PathBuf;

use agent_gateway::config::{GatewayConfig, RunnerConfig, API_KEY_ENV, DEFAULT_RUNNER_ID};
use agent_gateway::AppError;

const SAMPLE: &str = r#"
[server]
bind_address = "127.0.0.1:9100"
http_port = 9101
ipc_name = "gw-test"

[auth]
allow_loopback_without_key = false

[guard]
max_connection_attempts_per_window = 5
dos_block_seconds = 60

[capacity]
max_concurrent_sessions = 4

[capacity.agents]
claude = 2

[agent]
runner = "process"
command = "claude"
args = ["--print"]
working_dir = "/tmp/agents"

[paths]
log_dir = "/var/log/gw"
data_dir = "/var/lib/gw"

[runners.local-llm]
kind = "http"
endpoint = "http://127.0.0.1:8080/v1/chat/completions"
model = "llama"
api_key_env = "LLM_KEY"

[runners.mac-only]
kind = "process"
command = "agent-mac"
platform = "macos"
"#;

#[test]
fn parses_full_config() {
    let config = GatewayConfig::from_toml_str(SAMPLE).expect("valid config");

    assert_eq!(config.server.bind_address, "127.0.0.1:9100");
    assert_eq!(config.server.http_port, 9101);
    assert_eq!(config.server.ipc_name, "gw-test");
    assert!(!config.auth.allow_loopback_without_key);
    assert!(config.auth.api_key.is_none());
    assert_eq!(config.guard.max_connection_attempts_per_window, 5);
    assert_eq!(config.guard.dos_block_seconds, 60);
    // Unset guard fields keep their defaults.
    assert_eq!(config.guard.connection_attempt_window_seconds, 60);
    assert_eq!(config.capacity.max_concurrent_sessions, 4);
    assert_eq!(config.capacity.agents.get("claude"), Some(&2));
    assert_eq!(config.agent.command.as_deref(), Some("claude"));
    assert_eq!(config.agent.args, vec!["--print".to_owned()]);
    assert_eq!(config.agent.working_dir, Some(PathBuf::from("/tmp/agents")));

    assert!(matches!(
        config.runners.get("local-llm"),
        Some(RunnerConfig::Http { model, api_key_env: Some(env), .. })
            if model == "llama" && env == "LLM_KEY"
    ));
    assert!(matches!(
        config.runners.get("mac-only"),
        Some(RunnerConfig::Process { platform: Some(p), .. }) if p == "macos"
    ));
}

#[test]
fn empty_config_uses_defaults() {
    let config = GatewayConfig::from_toml_str("").expect("defaults");
    assert_eq!(config.agent.runner, DEFAULT_RUNNER_ID);
    assert!(config.agent.command.is_none());
    assert!(config.auth.allow_loopback_without_key);
    assert_eq!(config.server.ipc_name, "agent-gateway");
    assert!(config.runners.is_empty());
}

#[test]
fn derived_paths_follow_directories() {
    let config = GatewayConfig::from_toml_str(SAMPLE).expect("valid config");
    assert_eq!(
        config.event_log_path(),
        PathBuf::from("/var/log/gw/gateway-events.jsonl")
    );
    assert_eq!(
        config.upload_dir("s1"),
        PathBuf::from("/var/lib/gw/uploads/s1")
    );
    assert_eq!(config.ctl_token_path(), PathBuf::from("/var/lib/gw/ctl.token"));
    assert_eq!(config.bind_addr().expect("addr").port(), 9100);
}

#[test]
fn rejects_zero_guard_limit() {
    let err = GatewayConfig::from_toml_str("[guard]\nmax_client_messages_per_window = 0\n")
        .expect_err("zero limit");
    assert!(
        matches!(err, AppError::Config(ref msg) if msg.contains("max_client_messages_per_window")),
        "{err}"
    );
}

#[test]
fn rejects_agent_cap_above_server_cap() {
    let err = GatewayConfig::from_toml_str(
        "[capacity]\nmax_concurrent_sessions = 1\n[capacity.agents]\nclaude = 3\n",
    )
    .expect_err("agent cap too large");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("exceeds")));
}

#[test]
fn rejects_bad_bind_address() {
    let err = GatewayConfig::from_toml_str("[server]\nbind_address = \"nope\"\n")
        .expect_err("bad address");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn rejects_unknown_runner_kind() {
    let err = GatewayConfig::from_toml_str("[runners.x]\nkind = \"telepathy\"\n")
        .expect_err("unknown kind");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn load_from_path_reads_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, SAMPLE).expect("write");
    let config = GatewayConfig::load_from_path(&path).expect("load");
    assert_eq!(config.server.ipc_name, "gw-test");

    let missing = GatewayConfig::load_from_path(dir.path().join("missing.toml"));
    assert!(matches!(missing, Err(AppError::Config(_))));
}

#[test]
fn http_addr_defaults_to_loopback() {
    let config = GatewayConfig::from_toml_str(SAMPLE).expect("valid config");
    assert_eq!(
        config.http_addr().expect("addr").to_string(),
        "127.0.0.1:9101"
    );

    let config = GatewayConfig::from_toml_str("[server]\nhttp_bind = \"0.0.0.0:9200\"\n")
        .expect("valid config");
    assert_eq!(config.http_addr().expect("addr").port(), 9200);

    let err = GatewayConfig::from_toml_str("[server]\nhttp_bind = \"loopback\"\n")
        .expect_err("bad http bind");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("http_bind")));
}

#[tokio::test]
#[serial_test::serial]
async fn api_key_falls_back_to_environment() {
    std::env::set_var(API_KEY_ENV, "env-secret");
    let mut config = GatewayConfig::from_toml_str("").expect("defaults");
    config.load_credentials().await;
    std::env::remove_var(API_KEY_ENV);

    // A developer keychain entry takes precedence over the variable.
    assert!(config.auth.api_key.is_some());
}

#[tokio::test]
#[serial_test::serial]
async fn empty_api_key_env_is_ignored() {
    std::env::set_var(API_KEY_ENV, "");
    let mut config = GatewayConfig::from_toml_str("").expect("defaults");
    config.load_credentials().await;
    std::env::remove_var(API_KEY_ENV);

    assert_ne!(config.auth.api_key.as_deref(), Some(""));
}
