//! Process runner tests against real child processes.

#![cfg(unix)]

use std::time::Duration;

use agent_gateway::runner::process::{ProcessRunner, SESSION_ID_ENV};
use agent_gateway::runner::{AgentSession, Runner, RunnerSignal, SessionStreams, StartRequest};

const WAIT: Duration = Duration::from_secs(10);

fn sh(script: &str) -> ProcessRunner {
    ProcessRunner::new("process", Some("sh".into()), vec!["-c".into(), script.into()])
}

async fn start(runner: &ProcessRunner, session_id: &str) -> (AgentSession, SessionStreams) {
    let mut session = runner
        .start(StartRequest {
            session_id: session_id.into(),
            ..StartRequest::default()
        })
        .await
        .expect("spawn")
        .expect("runner available");
    let streams = session.take_streams().expect("streams");
    (session, streams)
}

#[tokio::test]
async fn cat_echoes_stdin_lines() {
    let runner = ProcessRunner::new("process", Some("cat".into()), Vec::new());
    let (session, mut streams) = start(&runner, "cat-1").await;

    session.send_input("hello agent").await.expect("send");
    let line = tokio::time::timeout(WAIT, streams.stdout.recv())
        .await
        .expect("timely output")
        .expect("line");
    assert_eq!(line, "hello agent");

    let exit = session.stop().await.expect("exit confirmed");
    assert!(exit.requested);
}

#[tokio::test]
async fn exit_code_and_stderr_are_reported() {
    let runner = sh("echo oops >&2; exit 3");
    let (session, mut streams) = start(&runner, "sh-1").await;

    let err_line = tokio::time::timeout(WAIT, streams.stderr.recv())
        .await
        .expect("timely stderr")
        .expect("line");
    assert_eq!(err_line, "oops");

    let exit = tokio::time::timeout(WAIT, session.wait_exit())
        .await
        .expect("timely exit");
    assert_eq!(exit.code, Some(3));
    assert!(!exit.requested);
    assert!(session.has_exited());
}

#[tokio::test]
async fn stop_kills_long_running_agent() {
    let runner = ProcessRunner::new("process", Some("sleep".into()), vec!["30".into()]);
    let (session, _streams) = start(&runner, "sleepy").await;
    assert!(!session.has_exited());

    let exit = tokio::time::timeout(WAIT, session.stop())
        .await
        .expect("stop within timeout")
        .expect("exit confirmed");
    assert!(exit.requested);
    assert_eq!(exit.reason, "stopped by gateway");
}

#[tokio::test]
async fn session_id_is_exported_to_agent() {
    let runner = sh(&format!("echo ${SESSION_ID_ENV}"));
    let (_session, mut streams) = start(&runner, "env-check").await;

    let line = tokio::time::timeout(WAIT, streams.stdout.recv())
        .await
        .expect("timely output")
        .expect("line");
    assert_eq!(line, "env-check");
}

#[tokio::test]
async fn gateway_secrets_do_not_leak_into_agent_env() {
    let runner = sh("echo \"key=${AGENT_GATEWAY_API_KEY:-unset}\"");
    let (_session, mut streams) = start(&runner, "env-clean").await;

    let line = tokio::time::timeout(WAIT, streams.stdout.recv())
        .await
        .expect("timely output")
        .expect("line");
    assert_eq!(line, "key=unset");
}

#[tokio::test]
async fn file_signal_becomes_runner_signal() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("report.txt"), b"done").expect("write");
    let runner = sh("echo ::file::report.txt; echo after")
        .with_working_dir(Some(dir.path().to_path_buf()));
    let (_session, mut streams) = start(&runner, "files").await;

    let signal = tokio::time::timeout(WAIT, streams.signals.recv())
        .await
        .expect("timely signal")
        .expect("signal");
    assert_eq!(
        signal,
        RunnerSignal::File {
            relative_path: "report.txt".into(),
            data: b"done".to_vec(),
        }
    );
    let line = tokio::time::timeout(WAIT, streams.stdout.recv())
        .await
        .expect("timely output")
        .expect("line");
    assert_eq!(line, "after");
}

#[tokio::test]
async fn escaping_file_signal_is_reported_on_stderr() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runner =
        sh("echo ::file::../secret.txt").with_working_dir(Some(dir.path().to_path_buf()));
    let (_session, mut streams) = start(&runner, "escape").await;

    let line = tokio::time::timeout(WAIT, streams.stderr.recv())
        .await
        .expect("timely stderr")
        .expect("line");
    assert!(line.starts_with("path violation"), "{line}");
}

#[tokio::test]
async fn missing_command_is_unavailable() {
    let runner = ProcessRunner::new("process", None, Vec::new());
    let started = runner
        .start(StartRequest::default())
        .await
        .expect("no spawn error");
    assert!(started.is_none());
}

#[tokio::test]
async fn unknown_binary_is_a_spawn_error() {
    let runner = ProcessRunner::new(
        "process",
        Some("definitely-not-a-real-agent-binary".into()),
        Vec::new(),
    );
    let result = runner.start(StartRequest::default()).await;
    assert!(matches!(result, Err(agent_gateway::AppError::Spawn(_))));
}

#[tokio::test]
async fn full_input_buffer_fails_fast_and_stop_still_works() {
    let runner = ProcessRunner::new("process", Some("sleep".into()), vec!["60".into()]);
    let (session, _streams) = start(&runner, "stalled-input").await;

    let chunk = "y".repeat(8 * 1024);
    let mut refused = None;
    for _ in 0..2_000 {
        if let Err(err) = session.try_send_input(chunk.as_str()) {
            refused = Some(err);
            break;
        }
        tokio::task::yield_now().await;
    }
    let err = refused.expect("input buffer fills while the agent ignores stdin");
    assert!(err.to_string().contains("agent input buffer full"), "{err}");

    let exit = tokio::time::timeout(WAIT, session.stop())
        .await
        .expect("stop returns")
        .expect("exit confirmed");
    assert!(exit.requested);
}
