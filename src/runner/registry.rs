//! Runner registry and configured-runner resolution.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::http::{HttpRunner, HttpRunnerConfig};
use super::process::ProcessRunner;
use super::Runner;
use crate::config::{GatewayConfig, RunnerConfig, DEFAULT_RUNNER_ID};
use crate::Result;

/// Id → runner table.
#[derive(Default)]
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn Runner>>,
}

impl RunnerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with the default process runner from `[agent]` plus
    /// every `[runners.<id>]` entry.
    ///
    /// A configured runner named `process` replaces the built-in one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if an HTTP runner cannot be built.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(
            ProcessRunner::new(
                DEFAULT_RUNNER_ID,
                config.agent.command.clone(),
                config.agent.args.clone(),
            )
            .with_working_dir(config.agent.working_dir.clone()),
        ));

        for (id, runner) in &config.runners {
            let built: Arc<dyn Runner> = match runner {
                RunnerConfig::Process {
                    command,
                    args,
                    platform,
                } => Arc::new(
                    ProcessRunner::new(id.clone(), Some(command.clone()), args.clone())
                        .with_platform(platform.clone())
                        .with_working_dir(config.agent.working_dir.clone()),
                ),
                RunnerConfig::Http {
                    endpoint,
                    model,
                    api_key_env,
                    system_prompt,
                } => Arc::new(HttpRunner::new(
                    id.clone(),
                    HttpRunnerConfig {
                        endpoint: endpoint.clone(),
                        model: model.clone(),
                        api_key_env: api_key_env.clone(),
                        system_prompt: system_prompt.clone(),
                    },
                )?),
            };
            registry.register(built);
        }

        info!(runners = ?registry.ids(), "runner registry ready");
        Ok(registry)
    }

    /// Add or replace a runner under its own id.
    pub fn register(&mut self, runner: Arc<dyn Runner>) {
        let id = runner.id().to_owned();
        if self.runners.insert(id.clone(), runner).is_some() {
            debug!(runner = id, "runner replaced");
        }
    }

    /// Look up a runner by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn Runner>> {
        self.runners.get(id).cloned()
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.runners.contains_key(id)
    }

    /// Registered ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runners.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Resolves which runner serves a session.
#[derive(Clone)]
pub struct RunnerFactory {
    registry: Arc<RunnerRegistry>,
    selected: String,
}

impl RunnerFactory {
    /// Factory preferring `selected`, falling back to the default runner.
    #[must_use]
    pub fn new(registry: Arc<RunnerRegistry>, selected: impl Into<String>) -> Self {
        Self {
            registry,
            selected: selected.into(),
        }
    }

    /// The configured runner, or the default process runner when the
    /// configured id is not registered.
    #[must_use]
    pub fn runner(&self) -> Option<Arc<dyn Runner>> {
        self.registry.get(&self.selected).or_else(|| {
            debug!(
                selected = self.selected,
                "configured runner not registered, using default"
            );
            self.registry.get(DEFAULT_RUNNER_ID)
        })
    }

    /// Runner for a client-requested agent id: an exact registry match wins,
    /// otherwise the configured runner.
    #[must_use]
    pub fn resolve(&self, requested: Option<&str>) -> Option<Arc<dyn Runner>> {
        requested
            .and_then(|id| self.registry.get(id))
            .or_else(|| self.runner())
    }

    /// Underlying registry.
    #[must_use]
    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }
}
