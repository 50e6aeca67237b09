//! Hot-reload watcher for the tunable limits in `config.toml`.
//!
//! [`ConfigWatcher`] uses the `notify` crate to watch `config.toml` for
//! file-system changes. When a change is detected it re-parses the full
//! configuration and pushes the `[guard]` limits and `[capacity]` caps into
//! the live services. Listener addresses, paths and runners still require a
//! restart.
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use agent_gateway::capacity::SessionCapacityManager;
//! use agent_gateway::config::{CapacityConfig, GuardLimits};
//! use agent_gateway::config_watcher::ConfigWatcher;
//! use agent_gateway::guard::ConnectionGuard;
//!
//! let guard = Arc::new(ConnectionGuard::new(GuardLimits::default()));
//! let capacity = Arc::new(SessionCapacityManager::new(&CapacityConfig::default()));
//! let _watcher = ConfigWatcher::new(Path::new("config.toml"), guard, capacity).expect("watcher");
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{info, warn};

use crate::capacity::SessionCapacityManager;
use crate::config::GatewayConfig;
use crate::guard::ConnectionGuard;
use crate::{AppError, Result};

/// Re-read `path` and apply its limits to the live services.
///
/// An invalid file leaves the current limits untouched.
///
/// # Errors
///
/// Returns `AppError::Config` if the file cannot be read, parsed or
/// validated.
pub fn apply_reload(
    path: &Path,
    guard: &ConnectionGuard,
    capacity: &SessionCapacityManager,
) -> Result<()> {
    let config = GatewayConfig::load_from_path(path)?;
    guard.update_limits(config.guard);
    capacity.update_caps(&config.capacity);
    info!(
        path = %path.display(),
        max_sessions = config.capacity.max_concurrent_sessions,
        "hot-reloaded guard limits and capacity caps"
    );
    Ok(())
}

/// Returns `true` for file-system events that indicate the watched file was
/// written or replaced.
fn is_config_change(event: &Event, config_path: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == config_path.file_name())
}

/// Hot-reload watcher for limits and caps.
///
/// Dropping a `ConfigWatcher` stops the underlying OS watch, so callers
/// must keep it alive for as long as hot-reload is needed.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Watch `config_path` and apply changes to `guard` and `capacity`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the `notify` watcher cannot be created
    /// or the path cannot be watched.
    pub fn new(
        config_path: &Path,
        guard: Arc<ConnectionGuard>,
        capacity: Arc<SessionCapacityManager>,
    ) -> Result<Self> {
        let path_for_callback: PathBuf = config_path.to_path_buf();

        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) if is_config_change(&event, &path_for_callback) => {
                    if let Err(err) = apply_reload(&path_for_callback, &guard, &capacity) {
                        warn!(
                            %err,
                            path = %path_for_callback.display(),
                            "config reload failed; keeping previous limits"
                        );
                    }
                }
                Err(err) => warn!(%err, "config file watcher error"),
                _ => {}
            },
        )
        .map_err(|err| AppError::Config(format!("failed to create config file watcher: {err}")))?;

        // Watch the parent so atomic rename-based writes are seen.
        let watch_target = config_path
            .parent()
            .filter(|p| p != &Path::new(""))
            .unwrap_or(Path::new("."));

        watcher
            .watch(watch_target, RecursiveMode::NonRecursive)
            .map_err(|err| {
                AppError::Config(format!(
                    "failed to watch config path '{}': {err}",
                    watch_target.display()
                ))
            })?;

        info!(path = %config_path.display(), "config watcher started");

        Ok(Self { _watcher: watcher })
    }
}
