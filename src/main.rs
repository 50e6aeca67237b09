#![forbid(unsafe_code)]

//! `agent-gateway`: session gateway server binary.
//!
//! Bootstraps configuration, opens the structured event log, and starts the
//! streaming listener, the management HTTP surface, and the IPC server for
//! `agent-gateway-ctl`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_gateway::capacity::{SessionCapacityManager, ABANDONED_RETENTION_HOURS};
use agent_gateway::config_watcher::ConfigWatcher;
use agent_gateway::eventlog::{EventType, LogLevel, LogRecord, StructuredEventLog};
use agent_gateway::gateway::{AuthPolicy, GatewayServices, SessionGateway};
use agent_gateway::guard::{spawn_idle_sweeper, ConnectionGuard};
use agent_gateway::ipc::server::{spawn_ipc_server, write_token_file, IpcState};
use agent_gateway::management::http::{serve_http, HttpState};
use agent_gateway::management::ManagementService;
use agent_gateway::runner::{RunnerFactory, RunnerRegistry};
use agent_gateway::{AppError, GatewayConfig, Result};

/// How often idle peer state is swept.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How often expired abandoned-session records are pruned.
const ABANDONED_PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-gateway", about = "Session gateway for local agent CLIs", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override `server.bind_address` for the streaming listener.
    #[arg(long)]
    bind: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-gateway bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GatewayConfig::load_from_path(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }
    let bind_addr = config.bind_addr()?;
    config.load_credentials().await;
    let config = Arc::new(config);
    info!("configuration loaded");

    // ── Core services ───────────────────────────────────
    let events = Arc::new(StructuredEventLog::open(config.event_log_path())?);
    let guard = Arc::new(ConnectionGuard::new(config.guard));
    let capacity = Arc::new(SessionCapacityManager::new(&config.capacity));
    let registry = Arc::new(RunnerRegistry::from_config(&config)?);
    let runners = RunnerFactory::new(Arc::clone(&registry), config.agent.runner.clone());
    let auth = Arc::new(AuthPolicy::from_config(&config.auth));
    info!(runners = ?registry.ids(), selected = %config.agent.runner, "runners registered");

    let services = GatewayServices {
        guard: Arc::clone(&guard),
        capacity: Arc::clone(&capacity),
        runners,
        events: Arc::clone(&events),
        auth: Arc::clone(&auth),
        upload_root: config.paths.data_dir.join("uploads"),
    };
    let management = Arc::new(ManagementService::new(
        Arc::clone(&guard),
        Arc::clone(&capacity),
        Arc::clone(&events),
        config.agent.runner.clone(),
    ));

    let ct = CancellationToken::new();

    // ── Background maintenance ──────────────────────────
    let sweeper_handle = spawn_idle_sweeper(Arc::clone(&guard), IDLE_SWEEP_INTERVAL, ct.clone());
    let prune_handle = spawn_abandoned_pruner(Arc::clone(&capacity), ct.clone());

    let _watcher = match ConfigWatcher::new(&args.config, Arc::clone(&guard), Arc::clone(&capacity)) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!(%err, "config hot-reload disabled");
            None
        }
    };

    // ── IPC server ──────────────────────────────────────
    let ipc_token = write_token_file(&config.ctl_token_path())?;
    let ipc_state = Arc::new(IpcState {
        service: Arc::clone(&management),
        auth_token: Some(ipc_token),
    });
    let ipc_handle = spawn_ipc_server(&config.server.ipc_name, ipc_state, ct.clone())?;

    // ── Management HTTP ─────────────────────────────────
    let http_addr = config.http_addr()?;
    let http_state = HttpState {
        service: Arc::clone(&management),
        auth: Arc::clone(&auth),
    };
    let http_ct = ct.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(err) = serve_http(http_state, http_addr, http_ct).await {
            error!(%err, "management http failed");
        }
    });

    // ── Streaming listener ──────────────────────────────
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {bind_addr}: {err}")))?;
    let gateway = SessionGateway::new(services);
    let gateway_ct = ct.clone();
    let gateway_handle = tokio::spawn(async move {
        if let Err(err) = gateway.serve(listener, gateway_ct).await {
            error!(%err, "session gateway failed");
        }
    });

    events.write(
        LogRecord::new(
            LogLevel::Info,
            EventType::GatewayStarted,
            "gateway started",
            "main",
        )
        .with_details(&json!({
            "bind_address": bind_addr.to_string(),
            "http_address": http_addr.to_string(),
            "ipc_name": config.server.ipc_name,
            "runner": config.agent.runner,
        })),
    );
    info!(%bind_addr, %http_addr, "agent-gateway ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    let _ = tokio::join!(
        gateway_handle,
        http_handle,
        ipc_handle,
        sweeper_handle,
        prune_handle
    );

    events.write(LogRecord::new(
        LogLevel::Info,
        EventType::GatewayStopped,
        "gateway stopped",
        "main",
    ));
    if let Err(err) = std::fs::remove_file(config.ctl_token_path()) {
        warn!(%err, "failed to remove ctl token file");
    }
    info!("agent-gateway shut down");

    Ok(())
}

fn spawn_abandoned_pruner(
    capacity: Arc<SessionCapacityManager>,
    ct: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let retention = chrono::Duration::hours(ABANDONED_RETENTION_HOURS);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = ct.cancelled() => break,
                () = tokio::time::sleep(ABANDONED_PRUNE_INTERVAL) => {}
            }
            let removed = capacity.prune_abandoned(retention);
            if removed > 0 {
                info!(removed, "pruned abandoned session records");
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
