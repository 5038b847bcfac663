//! Lifecycle state machine for locally managed engines.
//!
//! `stopped → starting → loading → running`, any of them may end in `failed`,
//! and `running`/`failed` go through `stopping` back to `stopped`. Each model
//! has an operation lock: a start holds it from validation until the engine is
//! ready or has failed, so a second start is rejected instead of queued. A stop
//! cancels the start in progress, then waits for the lock and tears down.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use quasar_common::{
    now_ms, Diagnosis, Endpoint, FailureKind, LifecycleState, ModelConfig, ModelRuntimeState,
};
use quasar_registry::ModelRegistry;
use quasar_router::Router;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::diagnose::diagnose;
use crate::engine::{container_name, create_engine, find_available_port, EngineContext, LaunchSettings, LaunchSpec};
use crate::gpu::GpuInventory;
use crate::readiness::{Backoff, ReadinessProbe};
use crate::runtime::{ContainerRuntime, ContainerStatus};
use crate::validate::{self, DryRunReport, Severity, ValidationError};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub models_base_dir: PathBuf,
    pub launch: LaunchSettings,
    /// How many ports past `launch.port_base` to try.
    pub port_search: u16,
    /// Host the gateway uses to reach published engine ports.
    pub engine_host: String,
    pub readiness_timeout: Duration,
    pub backoff: Backoff,
    pub stop_grace: Duration,
    pub log_tail_lines: usize,
    /// Fraction of device memory an engine may plan for unless the model sets
    /// `gpu_memory_utilization`.
    pub vram_safety_margin: f64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            models_base_dir: PathBuf::from("/models"),
            launch: LaunchSettings::default(),
            port_search: 64,
            engine_host: "127.0.0.1".to_string(),
            readiness_timeout: Duration::from_secs(600),
            backoff: Backoff::default(),
            stop_grace: Duration::from_secs(10),
            log_tail_lines: 200,
            vram_safety_margin: 0.9,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("model '{0}' is not registered")]
    NotFound(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("model '{id}' has a lifecycle operation in progress (state: {state})")]
    Busy { id: String, state: LifecycleState },
    #[error("engine for '{id}' failed to start: {message}")]
    ContainerStart {
        id: String,
        message: String,
        diagnosis: Option<Diagnosis>,
    },
    #[error("engine for '{id}' did not become ready: {message}")]
    ReadinessTimeout {
        id: String,
        message: String,
        diagnosis: Option<Diagnosis>,
    },
    #[error("model '{id}' is {state}; stop it first")]
    NotStopped { id: String, state: LifecycleState },
    #[error("start of '{id}' was cancelled by a stop request")]
    Cancelled { id: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl LifecycleError {
    fn from_failed(state: ModelRuntimeState) -> Self {
        let ModelRuntimeState {
            model_id,
            failure,
            last_error,
            diagnosis,
            ..
        } = state;
        let message = last_error.unwrap_or_else(|| "unknown failure".to_string());
        match failure {
            Some(FailureKind::ReadinessTimeout) => LifecycleError::ReadinessTimeout {
                id: model_id,
                message,
                diagnosis,
            },
            _ => LifecycleError::ContainerStart {
                id: model_id,
                message,
                diagnosis,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    #[serde(flatten)]
    pub runtime: ModelRuntimeState,
    /// Result of a live check; false unless the engine answered just now.
    pub ready: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    /// Read from the live container.
    Container,
    /// Captured when the engine failed; the container is gone.
    Captured,
    None,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogsReport {
    pub model_id: String,
    pub source: LogSource,
    pub logs: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<Diagnosis>,
}

fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ModelSlot {
    op: Arc<Mutex<()>>,
    state: watch::Sender<ModelRuntimeState>,
    cancel: std::sync::Mutex<CancellationToken>,
    captured_logs: std::sync::Mutex<Option<String>>,
}

impl ModelSlot {
    fn new(model_id: &str) -> Self {
        let (state, _) = watch::channel(ModelRuntimeState::stopped(model_id));
        Self {
            op: Arc::new(Mutex::new(())),
            state,
            cancel: std::sync::Mutex::new(CancellationToken::new()),
            captured_logs: std::sync::Mutex::new(None),
        }
    }

    fn current(&self) -> ModelRuntimeState {
        self.state.borrow().clone()
    }

    fn cancel_in_progress(&self) {
        lock(&self.cancel).cancel();
    }

    fn cancel_token(&self) -> CancellationToken {
        lock(&self.cancel).clone()
    }

    fn reset_cancel(&self) {
        *lock(&self.cancel) = CancellationToken::new();
    }
}

const STATES: [LifecycleState; 6] = [
    LifecycleState::Stopped,
    LifecycleState::Starting,
    LifecycleState::Loading,
    LifecycleState::Running,
    LifecycleState::Failed,
    LifecycleState::Stopping,
];

fn state_index(state: LifecycleState) -> usize {
    STATES.iter().position(|s| *s == state).unwrap_or(0)
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    registry: Arc<dyn ModelRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    readiness: Arc<dyn ReadinessProbe>,
    gpus: Arc<dyn GpuInventory>,
    router: Arc<Router>,
    slots: DashMap<String, Arc<ModelSlot>>,
    /// host port -> model id
    ports: Mutex<HashMap<u16, String>>,
    transitions: [AtomicU64; 6],
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        registry: Arc<dyn ModelRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        readiness: Arc<dyn ReadinessProbe>,
        gpus: Arc<dyn GpuInventory>,
        router: Arc<Router>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            registry,
            runtime,
            readiness,
            gpus,
            router,
            slots: DashMap::new(),
            ports: Mutex::new(HashMap::new()),
            transitions: Default::default(),
        })
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<dyn ModelRegistry> {
        &self.registry
    }

    /// Current runtime state; `stopped` for models never started.
    pub fn state(&self, model_id: &str) -> ModelRuntimeState {
        self.slots
            .get(model_id)
            .map(|s| s.current())
            .unwrap_or_else(|| ModelRuntimeState::stopped(model_id))
    }

    /// Every model that has a runtime slot, ordered by id.
    pub fn states(&self) -> Vec<ModelRuntimeState> {
        let mut out: Vec<ModelRuntimeState> = self.slots.iter().map(|s| s.current()).collect();
        out.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        out
    }

    /// Number of entries into each state since startup.
    pub fn transitions_total(&self) -> Vec<(LifecycleState, u64)> {
        STATES
            .iter()
            .map(|s| (*s, self.transitions[state_index(*s)].load(Ordering::Relaxed)))
            .collect()
    }

    fn slot(&self, model_id: &str) -> Arc<ModelSlot> {
        self.slots
            .entry(model_id.to_string())
            .or_insert_with(|| Arc::new(ModelSlot::new(model_id)))
            .value()
            .clone()
    }

    fn set_state(&self, slot: &ModelSlot, next: ModelRuntimeState) {
        let model_id = next.model_id.clone();
        let to = next.state;
        let from = slot.state.send_replace(next).state;
        self.transitions[state_index(to)].fetch_add(1, Ordering::Relaxed);
        tracing::info!(%model_id, %from, %to, "lifecycle transition");
    }

    async fn config(&self, model_id: &str) -> Result<ModelConfig, LifecycleError> {
        self.registry
            .get(model_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(model_id.to_string()))
    }

    async fn reserve_port(&self, model_id: &str, configured: Option<u16>) -> Result<u16, LifecycleError> {
        let mut ports = self.ports.lock().await;
        ports.retain(|_, owner| owner != model_id);
        let port = match configured {
            Some(port) => {
                if let Some(owner) = ports.get(&port) {
                    tracing::warn!(model_id, port, %owner, "configured port is already held by another model");
                }
                port
            }
            None => {
                let reserved: HashSet<u16> = ports.keys().copied().collect();
                find_available_port(self.settings.launch.port_base, self.settings.port_search, &reserved).await?
            }
        };
        ports.insert(port, model_id.to_string());
        Ok(port)
    }

    async fn release_port(&self, model_id: &str) {
        self.ports.lock().await.retain(|_, owner| owner != model_id);
    }

    fn deregister(&self, model_id: &str) {
        let endpoint_id = Endpoint::managed_id(model_id);
        self.router.pools().remove(&endpoint_id);
        self.router.health().remove(&endpoint_id);
        self.router.forget_endpoint(&endpoint_id);
    }

    /// Validates and launches `model_id`. Returns once the engine is `running`
    /// when `wait` is set, otherwise right after entering `starting`.
    pub async fn start(self: &Arc<Self>, model_id: &str, wait: bool) -> Result<ModelRuntimeState, LifecycleError> {
        self.config(model_id).await?;
        let slot = self.slot(model_id);
        let guard = slot
            .op
            .clone()
            .try_lock_owned()
            .map_err(|_| LifecycleError::Busy {
                id: model_id.to_string(),
                state: slot.current().state,
            })?;
        // Read again under the lock; an unregister may have won the race.
        let config = self.config(model_id).await?;

        let current = slot.current();
        match current.state {
            LifecycleState::Running => return Ok(current),
            LifecycleState::Failed => self.teardown(&slot, model_id, current).await,
            _ => {}
        }

        let gpus = self.gpus.gpus().await;
        let pre = validate::preflight(
            &config,
            &self.settings.models_base_dir,
            &gpus,
            self.settings.vram_safety_margin,
        )
        .inspect_err(|e| tracing::warn!(model_id, error = %e, "pre-flight validation failed"))?;
        for w in pre.warnings.iter().filter(|w| w.severity != Severity::Info) {
            tracing::warn!(model_id, title = %w.title, "{}", w.message);
        }

        let port = self.reserve_port(model_id, config.port).await?;
        let engine = create_engine(config.engine_type);
        let spec = engine.launch_spec(
            &EngineContext {
                config: &config,
                weights: &pre.weights,
                draft: pre.draft.as_ref(),
                host_port: port,
            },
            &self.settings.launch,
        );
        let readiness_path = engine.readiness_path();
        let base_url = format!("http://{}:{}", self.settings.engine_host, port);

        // Reset only by a completed stop, so a stop issued during validation
        // still cancels this start.
        let cancel = slot.cancel_token();
        *lock(&slot.captured_logs) = None;
        let starting = ModelRuntimeState {
            state: LifecycleState::Starting,
            container_name: Some(spec.container_name.clone()),
            base_url: Some(base_url.clone()),
            port: Some(port),
            started_at_ms: Some(now_ms()),
            ..ModelRuntimeState::stopped(model_id)
        };
        self.set_state(&slot, starting.clone());
        let mut rx = slot.state.subscribe();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            this.drive_start(&slot, &config, &spec, &base_url, readiness_path, cancel)
                .await;
        });

        if !wait {
            return Ok(starting);
        }
        let settled = rx
            .wait_for(|s| !s.state.is_transitioning())
            .await
            .map(|s| (*s).clone())
            .map_err(|_| anyhow::anyhow!("lifecycle state channel closed"))?;
        match settled.state {
            LifecycleState::Running => Ok(settled),
            LifecycleState::Failed => Err(LifecycleError::from_failed(settled)),
            _ => Err(LifecycleError::Cancelled {
                id: model_id.to_string(),
            }),
        }
    }

    /// Runs with the operation lock held. Returns early on cancellation and
    /// leaves cleanup to the stop that cancelled it.
    async fn drive_start(
        &self,
        slot: &ModelSlot,
        config: &ModelConfig,
        spec: &LaunchSpec,
        base_url: &str,
        readiness_path: &str,
        cancel: CancellationToken,
    ) {
        let id = config.id.as_str();
        let name = spec.container_name.as_str();

        let launched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            r = self.runtime.run(spec) => r,
        };
        if let Err(e) = launched {
            self.fail(slot, id, name, FailureKind::ContainerStart, format!("{e:#}"))
                .await;
            return;
        }

        let deadline = Instant::now() + self.settings.readiness_timeout;
        let mut attempt = 0u32;
        loop {
            match self.runtime.status(name).await {
                Ok(ContainerStatus::Running) => {
                    if slot.current().state == LifecycleState::Starting {
                        let mut loading = slot.current();
                        loading.state = LifecycleState::Loading;
                        self.set_state(slot, loading);
                    }
                    let ready = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        r = self.readiness.is_ready(base_url, readiness_path) => r,
                    };
                    if ready {
                        break;
                    }
                }
                Ok(ContainerStatus::Exited { code }) => {
                    let code = code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".into());
                    self.fail(
                        slot,
                        id,
                        name,
                        FailureKind::ContainerExited,
                        format!("container exited with code {code} before becoming ready"),
                    )
                    .await;
                    return;
                }
                Ok(ContainerStatus::NotFound) => {
                    self.fail(
                        slot,
                        id,
                        name,
                        FailureKind::ContainerExited,
                        "container disappeared before becoming ready".to_string(),
                    )
                    .await;
                    return;
                }
                Ok(ContainerStatus::Other) => {}
                Err(e) => tracing::warn!(model_id = id, error = %e, "container status check failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                let msg = format!(
                    "readiness check did not pass within {:?}",
                    self.settings.readiness_timeout
                );
                self.fail(slot, id, name, FailureKind::ReadinessTimeout, msg).await;
                return;
            }
            let delay = self.settings.backoff.delay(attempt).min(deadline - now);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.router
            .pools()
            .upsert(Endpoint::managed(config.pool, id, base_url));
        let mut running = slot.current();
        running.state = LifecycleState::Running;
        self.set_state(slot, running);
        tracing::info!(model_id = id, %base_url, polls = attempt + 1, "engine ready");
    }

    /// Captures logs and a diagnosis, removes the container and moves to `failed`.
    async fn fail(&self, slot: &ModelSlot, model_id: &str, name: &str, kind: FailureKind, error: String) {
        let logs = match self.runtime.logs(name, self.settings.log_tail_lines).await {
            Ok(logs) => logs,
            Err(e) => {
                tracing::debug!(model_id, error = %e, "no container logs to capture");
                String::new()
            }
        };
        // The runtime error is the last line so it wins when the logs say nothing.
        let diagnosis = diagnose(&format!("{logs}\n{error}"));
        *lock(&slot.captured_logs) = Some(logs);

        if let Err(e) = self.runtime.remove(name).await {
            tracing::warn!(model_id, container = name, error = %e, "failed to remove container");
        }
        self.deregister(model_id);
        self.release_port(model_id).await;

        tracing::error!(
            model_id,
            failure = ?kind,
            diagnosis = ?diagnosis.kind,
            %error,
            "engine failed"
        );
        self.set_state(
            slot,
            ModelRuntimeState {
                state: LifecycleState::Failed,
                failure: Some(kind),
                last_error: Some(error),
                diagnosis: Some(diagnosis),
                ..ModelRuntimeState::stopped(model_id)
            },
        );
    }

    /// `stopping → stopped`. Teardown errors are logged; `stopped` is reached anyway.
    async fn teardown(&self, slot: &ModelSlot, model_id: &str, current: ModelRuntimeState) {
        let name = current
            .container_name
            .clone()
            .unwrap_or_else(|| container_name(model_id));
        let mut stopping = current;
        stopping.state = LifecycleState::Stopping;
        self.set_state(slot, stopping);

        self.deregister(model_id);
        if let Err(e) = self.runtime.stop(&name, self.settings.stop_grace).await {
            tracing::warn!(model_id, container = %name, error = %e, "graceful stop failed, forcing removal");
        }
        if let Err(e) = self.runtime.remove(&name).await {
            tracing::warn!(model_id, container = %name, error = %e, "failed to remove container");
        }
        self.release_port(model_id).await;
        *lock(&slot.captured_logs) = None;
        slot.reset_cancel();
        self.set_state(slot, ModelRuntimeState::stopped(model_id));
    }

    /// Stops `model_id`, cancelling a start in progress. Idempotent.
    pub async fn stop(&self, model_id: &str) -> Result<ModelRuntimeState, LifecycleError> {
        let slot = match self.slots.get(model_id).map(|s| Arc::clone(s.value())) {
            Some(slot) => slot,
            None => {
                self.config(model_id).await?;
                return Ok(ModelRuntimeState::stopped(model_id));
            }
        };
        slot.cancel_in_progress();
        let _guard = slot.op.lock().await;

        let current = slot.current();
        if current.state == LifecycleState::Stopped {
            slot.reset_cancel();
            return Ok(current);
        }
        self.teardown(&slot, model_id, current).await;
        Ok(slot.current())
    }

    /// Removes a stopped model from the registry. The state check and the
    /// delete run under the model's operation lock, so no start can land
    /// between them.
    pub async fn unregister(&self, model_id: &str) -> Result<(), LifecycleError> {
        let slot = self.slot(model_id);
        let _guard = slot
            .op
            .clone()
            .try_lock_owned()
            .map_err(|_| LifecycleError::Busy {
                id: model_id.to_string(),
                state: slot.current().state,
            })?;

        let state = slot.current().state;
        if state != LifecycleState::Stopped {
            return Err(LifecycleError::NotStopped {
                id: model_id.to_string(),
                state,
            });
        }
        let deleted = self.registry.delete(model_id).await?;
        self.slots.remove_if(model_id, |_, s| Arc::ptr_eq(s, &slot));
        if !deleted {
            return Err(LifecycleError::NotFound(model_id.to_string()));
        }
        tracing::info!(model_id, "model unregistered");
        Ok(())
    }

    /// Re-reads the registry entry and restarts the model with it. The new
    /// config is validated before the running engine is touched.
    pub async fn apply(self: &Arc<Self>, model_id: &str, wait: bool) -> Result<ModelRuntimeState, LifecycleError> {
        let config = self.config(model_id).await?;
        let gpus = self.gpus.gpus().await;
        validate::preflight(
            &config,
            &self.settings.models_base_dir,
            &gpus,
            self.settings.vram_safety_margin,
        )?;
        self.stop(model_id).await?;
        self.start(model_id, wait).await
    }

    pub async fn readiness(&self, model_id: &str) -> Result<ReadinessReport, LifecycleError> {
        let config = self.config(model_id).await?;
        let runtime = self.state(model_id);
        let ready = match (runtime.state, runtime.base_url.as_deref()) {
            (LifecycleState::Loading | LifecycleState::Running, Some(url)) => {
                let path = create_engine(config.engine_type).readiness_path();
                self.readiness.is_ready(url, path).await
            }
            _ => false,
        };
        Ok(ReadinessReport { runtime, ready })
    }

    pub async fn logs(&self, model_id: &str, tail: usize, with_diagnosis: bool) -> Result<LogsReport, LifecycleError> {
        self.config(model_id).await?;
        let runtime = self.state(model_id);
        let captured = self.slots.get(model_id).and_then(|s| {
            let logs = lock(&s.captured_logs).clone();
            logs
        });

        let (logs, source) = match runtime.container_name.as_deref() {
            Some(name) => match self.runtime.logs(name, tail).await {
                Ok(logs) => (logs, LogSource::Container),
                Err(e) => {
                    tracing::warn!(model_id, error = %e, "failed to read container logs");
                    (String::new(), LogSource::None)
                }
            },
            None => match captured {
                Some(logs) => (tail_lines(&logs, tail), LogSource::Captured),
                None => (String::new(), LogSource::None),
            },
        };

        let diagnosis = if with_diagnosis {
            runtime.diagnosis.clone().or_else(|| match source {
                LogSource::None => None,
                _ => Some(diagnose(&logs)),
            })
        } else {
            None
        };
        Ok(LogsReport {
            model_id: model_id.to_string(),
            source,
            logs,
            diagnosis,
        })
    }

    /// Validation plus the launch command, without creating anything.
    pub async fn dry_run(&self, model_id: &str) -> Result<DryRunReport, LifecycleError> {
        let config = self.config(model_id).await?;
        let gpus = self.gpus.gpus().await;
        let engine = create_engine(config.engine_type);
        let report = validate::dry_run(
            &config,
            engine.as_ref(),
            &self.settings.launch,
            &self.settings.models_base_dir,
            &gpus,
            self.settings.vram_safety_margin,
        )?;
        Ok(report)
    }

    /// One supervisor pass: a running model whose container is gone moves to `failed`.
    pub async fn supervise_once(&self) {
        let slots: Vec<(String, Arc<ModelSlot>)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (model_id, slot) in slots {
            if slot.current().state != LifecycleState::Running {
                continue;
            }
            // A start or stop owns the model right now.
            let Ok(_guard) = slot.op.clone().try_lock_owned() else {
                continue;
            };
            let current = slot.current();
            if current.state != LifecycleState::Running {
                continue;
            }
            let name = current
                .container_name
                .clone()
                .unwrap_or_else(|| container_name(&model_id));
            let message = match self.runtime.status(&name).await {
                Ok(ContainerStatus::Exited { code }) => format!(
                    "container exited unexpectedly with code {}",
                    code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".into())
                ),
                Ok(ContainerStatus::NotFound) => "container disappeared".to_string(),
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(%model_id, error = %e, "supervisor status check failed");
                    continue;
                }
            };
            self.fail(&slot, &model_id, &name, FailureKind::ContainerExited, message)
                .await;
        }
    }

    pub fn spawn_supervisor(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("container supervisor stopped");
                        return;
                    }
                    _ = tick.tick() => this.supervise_once().await,
                }
            }
        })
    }

    /// Stops every model that is not already stopped.
    pub async fn shutdown_all(&self) {
        let active: Vec<String> = self
            .slots
            .iter()
            .filter(|s| s.current().state != LifecycleState::Stopped)
            .map(|s| s.key().clone())
            .collect();
        for model_id in active {
            match self.stop(&model_id).await {
                Ok(_) => tracing::info!(%model_id, "stopped managed model on shutdown"),
                Err(e) => tracing::warn!(%model_id, error = %e, "failed to stop managed model on shutdown"),
            }
        }
    }
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use async_trait::async_trait;
    use quasar_common::{DiagnosisKind, EngineType, HealthSnapshot, HealthStatus};
    use quasar_registry::MemoryRegistry;
    use quasar_router::{BreakerConfig, HealthState, RoundRobin, UpstreamPools};

    use crate::gpu::StaticGpus;

    #[derive(Default)]
    struct FakeRuntime {
        containers: std::sync::Mutex<HashMap<String, ContainerStatus>>,
        runs: AtomicUsize,
        run_error: Option<String>,
        exit_on_run: Option<i32>,
        logs: String,
    }

    impl FakeRuntime {
        fn exit(&self, name: &str, code: i32) {
            lock(&self.containers).insert(name.to_string(), ContainerStatus::Exited { code: Some(code) });
        }

        fn live(&self) -> usize {
            lock(&self.containers).len()
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn run(&self, spec: &LaunchSpec) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = &self.run_error {
                anyhow::bail!("{err}");
            }
            let status = match self.exit_on_run {
                Some(code) => ContainerStatus::Exited { code: Some(code) },
                None => ContainerStatus::Running,
            };
            lock(&self.containers).insert(spec.container_name.clone(), status);
            Ok(())
        }

        async fn status(&self, name: &str) -> anyhow::Result<ContainerStatus> {
            Ok(lock(&self.containers)
                .get(name)
                .copied()
                .unwrap_or(ContainerStatus::NotFound))
        }

        async fn logs(&self, name: &str, _tail: usize) -> anyhow::Result<String> {
            if !lock(&self.containers).contains_key(name) {
                anyhow::bail!("no such container: {name}");
            }
            Ok(self.logs.clone())
        }

        async fn stop(&self, name: &str, _grace: Duration) -> anyhow::Result<()> {
            if let Some(s) = lock(&self.containers).get_mut(name) {
                *s = ContainerStatus::Exited { code: Some(0) };
            }
            Ok(())
        }

        async fn remove(&self, name: &str) -> anyhow::Result<()> {
            lock(&self.containers).remove(name);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeReadiness {
        ready: AtomicBool,
    }

    #[async_trait]
    impl ReadinessProbe for FakeReadiness {
        async fn is_ready(&self, _base_url: &str, _path: &str) -> bool {
            self.ready.load(Ordering::SeqCst)
        }
    }

    struct Harness {
        orch: Arc<Orchestrator>,
        runtime: Arc<FakeRuntime>,
        readiness: Arc<FakeReadiness>,
        router: Arc<Router>,
        registry: Arc<MemoryRegistry>,
        _dir: tempfile::TempDir,
    }

    fn model(id: &str, path: &str) -> ModelConfig {
        let mut cfg = ModelConfig::new(id, EngineType::Vllm, path);
        cfg.port = Some(28000);
        cfg
    }

    fn harness(runtime: FakeRuntime, readiness_timeout: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("m1");
        std::fs::create_dir_all(&weights).unwrap();
        std::fs::write(weights.join("config.json"), b"{}").unwrap();
        std::fs::write(weights.join("model.safetensors"), [0u8; 1024]).unwrap();

        let registry = Arc::new(MemoryRegistry::with_models(vec![
            model("m1", "m1"),
            model("ghost", "missing-dir"),
        ]));
        let router = Router::new(
            Arc::new(UpstreamPools::new(Vec::new())),
            Arc::new(HealthState::new(Duration::from_secs(30))),
            BreakerConfig::default(),
            Box::new(RoundRobin::default()),
        );
        let runtime = Arc::new(runtime);
        let readiness = Arc::new(FakeReadiness::default());
        let settings = OrchestratorSettings {
            models_base_dir: dir.path().to_path_buf(),
            readiness_timeout,
            backoff: Backoff {
                initial: Duration::from_millis(5),
                factor: 2.0,
                max: Duration::from_millis(20),
            },
            stop_grace: Duration::from_secs(1),
            ..OrchestratorSettings::default()
        };
        let orch = Orchestrator::new(
            settings,
            registry.clone(),
            runtime.clone(),
            readiness.clone(),
            Arc::new(StaticGpus::uniform(1, 81_920)),
            router.clone(),
        );
        Harness {
            orch,
            runtime,
            readiness,
            router,
            registry,
            _dir: dir,
        }
    }

    async fn wait_for_state(orch: &Orchestrator, id: &str, state: LifecycleState) {
        for _ in 0..200 {
            if orch.state(id).state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{id} never reached {state}, now {}", orch.state(id).state);
    }

    #[tokio::test]
    async fn missing_weights_fail_validation_without_container() {
        let h = harness(FakeRuntime::default(), Duration::from_secs(5));
        let err = h.orch.start("ghost", true).await.unwrap_err();
        assert!(
            matches!(err, LifecycleError::Validation(ValidationError::NotFound { .. })),
            "{err}"
        );
        assert_eq!(h.orch.state("ghost"), ModelRuntimeState::stopped("ghost"));
        assert_eq!(h.runtime.runs.load(Ordering::SeqCst), 0);
        assert_eq!(h.runtime.live(), 0);
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let h = harness(FakeRuntime::default(), Duration::from_secs(5));
        assert!(matches!(h.orch.start("nope", false).await, Err(LifecycleError::NotFound(_))));
        assert!(matches!(h.orch.stop("nope").await, Err(LifecycleError::NotFound(_))));
    }

    #[tokio::test]
    async fn round_trip_restores_initial_state() {
        let h = harness(FakeRuntime::default(), Duration::from_secs(5));
        let initial = h.orch.state("m1");
        let endpoint_id = Endpoint::managed_id("m1");
        h.readiness.ready.store(true, Ordering::SeqCst);

        let running = h.orch.start("m1", true).await.unwrap();
        assert_eq!(running.state, LifecycleState::Running);
        assert_eq!(running.base_url.as_deref(), Some("http://127.0.0.1:28000"));
        assert!(h.router.pools().contains(&endpoint_id));
        // The prober would have published a snapshot by now.
        let live: HashSet<String> = [endpoint_id.clone()].into_iter().collect();
        h.router.health().publish(
            [(
                endpoint_id.clone(),
                HealthSnapshot {
                    status: HealthStatus::Healthy,
                    last_checked_ms: now_ms(),
                    last_success_ms: Some(now_ms()),
                    latency_ms: Some(3),
                    consecutive_failures: 0,
                    last_error: None,
                },
            )]
            .into_iter()
            .collect(),
            &live,
        );

        let stopped = h.orch.stop("m1").await.unwrap();
        assert_eq!(stopped, initial);
        assert_eq!(h.orch.state("m1"), initial);
        assert!(!h.router.pools().contains(&endpoint_id));
        assert!(h.router.health().get(&endpoint_id).is_none());
        assert_eq!(h.runtime.live(), 0);
        assert!(h.orch.ports.lock().await.is_empty());

        let entered: HashMap<LifecycleState, u64> = h.orch.transitions_total().into_iter().collect();
        for s in [
            LifecycleState::Starting,
            LifecycleState::Loading,
            LifecycleState::Running,
            LifecycleState::Stopping,
            LifecycleState::Stopped,
        ] {
            assert_eq!(entered[&s], 1, "{s}");
        }
    }

    #[tokio::test]
    async fn second_start_while_loading_is_rejected() {
        let h = harness(FakeRuntime::default(), Duration::from_secs(30));
        let first = h.orch.start("m1", false).await.unwrap();
        assert_eq!(first.state, LifecycleState::Starting);
        wait_for_state(&h.orch, "m1", LifecycleState::Loading).await;

        match h.orch.start("m1", false).await {
            Err(LifecycleError::Busy { state, .. }) => assert_eq!(state, LifecycleState::Loading),
            other => panic!("expected Busy, got {other:?}"),
        }
        assert_eq!(h.runtime.runs.load(Ordering::SeqCst), 1);

        // Stop cancels the pending start and removes the container.
        let stopped = h.orch.stop("m1").await.unwrap();
        assert_eq!(stopped, ModelRuntimeState::stopped("m1"));
        assert_eq!(h.runtime.live(), 0);
    }

    #[tokio::test]
    async fn stop_unblocks_a_waiting_start() {
        let h = harness(FakeRuntime::default(), Duration::from_secs(30));
        let orch = h.orch.clone();
        let waiter = tokio::spawn(async move { orch.start("m1", true).await });
        wait_for_state(&h.orch, "m1", LifecycleState::Loading).await;
        h.orch.stop("m1").await.unwrap();
        let res = waiter.await.unwrap();
        assert!(matches!(res, Err(LifecycleError::Cancelled { .. })), "{res:?}");
    }

    #[tokio::test]
    async fn readiness_timeout_captures_diagnosis() {
        let runtime = FakeRuntime {
            logs: "loading weights\ntorch.OutOfMemoryError: CUDA out of memory.\n".into(),
            ..FakeRuntime::default()
        };
        let h = harness(runtime, Duration::from_millis(100));
        let err = h.orch.start("m1", true).await.unwrap_err();
        match err {
            LifecycleError::ReadinessTimeout { diagnosis, .. } => {
                assert_eq!(diagnosis.unwrap().kind, DiagnosisKind::OutOfMemory)
            }
            other => panic!("unexpected {other:?}"),
        }
        let state = h.orch.state("m1");
        assert_eq!(state.state, LifecycleState::Failed);
        assert_eq!(state.failure, Some(FailureKind::ReadinessTimeout));
        assert!(state.container_name.is_none());
        assert_eq!(h.runtime.live(), 0);

        let logs = h.orch.logs("m1", 1, true).await.unwrap();
        assert_eq!(logs.source, LogSource::Captured);
        assert_eq!(logs.logs, "torch.OutOfMemoryError: CUDA out of memory.");
        assert_eq!(logs.diagnosis.unwrap().kind, DiagnosisKind::OutOfMemory);

        // A failed model can be started again.
        h.readiness.ready.store(true, Ordering::SeqCst);
        let running = h.orch.start("m1", true).await.unwrap();
        assert_eq!(running.state, LifecycleState::Running);
        assert!(running.diagnosis.is_none());
    }

    #[tokio::test]
    async fn early_exit_is_a_start_failure() {
        let runtime = FakeRuntime {
            exit_on_run: Some(1),
            logs: "FileNotFoundError: No such file or directory: '/model/config.json'".into(),
            ..FakeRuntime::default()
        };
        let h = harness(runtime, Duration::from_secs(5));
        match h.orch.start("m1", true).await {
            Err(LifecycleError::ContainerStart { diagnosis, message, .. }) => {
                assert!(message.contains("code 1"));
                assert_eq!(diagnosis.unwrap().kind, DiagnosisKind::MissingWeights);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.orch.state("m1").failure, Some(FailureKind::ContainerExited));
    }

    #[tokio::test]
    async fn runtime_refusal_is_diagnosed_from_error() {
        let runtime = FakeRuntime {
            run_error: Some("docker run failed: Bind for 0.0.0.0:28000 failed: port is already allocated".into()),
            ..FakeRuntime::default()
        };
        let h = harness(runtime, Duration::from_secs(5));
        match h.orch.start("m1", true).await {
            Err(LifecycleError::ContainerStart { diagnosis, .. }) => {
                assert_eq!(diagnosis.unwrap().kind, DiagnosisKind::PortConflict)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.orch.state("m1").failure, Some(FailureKind::ContainerStart));
        assert!(h.orch.ports.lock().await.is_empty());
    }

    #[tokio::test]
    async fn dry_run_is_idempotent_and_side_effect_free() {
        let h = harness(FakeRuntime::default(), Duration::from_secs(5));
        let a = h.orch.dry_run("m1").await.unwrap();
        let b = h.orch.dry_run("m1").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.container_name, "quasar-m1");
        assert!(a.command_line.contains("-p 28000:8000"));
        assert_eq!(h.runtime.runs.load(Ordering::SeqCst), 0);
        assert_eq!(h.orch.state("m1"), ModelRuntimeState::stopped("m1"));

        assert!(matches!(
            h.orch.dry_run("ghost").await,
            Err(LifecycleError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn supervisor_marks_exited_container_failed() {
        let h = harness(FakeRuntime::default(), Duration::from_secs(5));
        h.readiness.ready.store(true, Ordering::SeqCst);
        h.orch.start("m1", true).await.unwrap();

        h.orch.supervise_once().await;
        assert_eq!(h.orch.state("m1").state, LifecycleState::Running);

        h.runtime.exit("quasar-m1", 137);
        h.orch.supervise_once().await;
        let state = h.orch.state("m1");
        assert_eq!(state.state, LifecycleState::Failed);
        assert_eq!(state.failure, Some(FailureKind::ContainerExited));
        assert!(!h.router.pools().contains(&Endpoint::managed_id("m1")));

        let stopped = h.orch.stop("m1").await.unwrap();
        assert_eq!(stopped, ModelRuntimeState::stopped("m1"));
    }

    #[tokio::test]
    async fn apply_validates_before_stopping() {
        let h = harness(FakeRuntime::default(), Duration::from_secs(5));
        h.readiness.ready.store(true, Ordering::SeqCst);
        h.orch.start("m1", true).await.unwrap();

        h.registry.put(model("m1", "moved-away")).await.unwrap();
        let err = h.orch.apply("m1", true).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)));
        assert_eq!(h.orch.state("m1").state, LifecycleState::Running);

        let mut cfg = model("m1", "m1");
        cfg.context_length = Some(2048);
        h.registry.put(cfg).await.unwrap();
        let state = h.orch.apply("m1", true).await.unwrap();
        assert_eq!(state.state, LifecycleState::Running);
        assert_eq!(h.runtime.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unregister_holds_the_lifecycle_lock() {
        let h = harness(FakeRuntime::default(), Duration::from_secs(30));
        h.orch.start("m1", false).await.unwrap();
        wait_for_state(&h.orch, "m1", LifecycleState::Loading).await;
        assert!(
            matches!(h.orch.unregister("m1").await, Err(LifecycleError::Busy { .. })),
            "a start in flight blocks the delete"
        );
        assert!(h.registry.get("m1").await.unwrap().is_some());

        h.readiness.ready.store(true, Ordering::SeqCst);
        wait_for_state(&h.orch, "m1", LifecycleState::Running).await;
        match h.orch.unregister("m1").await {
            Err(LifecycleError::NotStopped { state, .. }) => assert_eq!(state, LifecycleState::Running),
            other => panic!("expected NotStopped, got {other:?}"),
        }
        assert!(h.registry.get("m1").await.unwrap().is_some());

        h.orch.stop("m1").await.unwrap();
        h.orch.unregister("m1").await.unwrap();
        assert!(h.registry.get("m1").await.unwrap().is_none());
        assert!(h.orch.states().iter().all(|s| s.model_id != "m1"));
        assert!(matches!(h.orch.start("m1", true).await, Err(LifecycleError::NotFound(_))));
        assert!(matches!(h.orch.unregister("m1").await, Err(LifecycleError::NotFound(_))));
        assert_eq!(h.runtime.live(), 0);
    }

    #[tokio::test]
    async fn readiness_report_and_shutdown() {
        let h = harness(FakeRuntime::default(), Duration::from_secs(5));
        let report = h.orch.readiness("m1").await.unwrap();
        assert!(!report.ready);

        h.readiness.ready.store(true, Ordering::SeqCst);
        h.orch.start("m1", true).await.unwrap();
        let report = h.orch.readiness("m1").await.unwrap();
        assert!(report.ready);
        assert_eq!(report.runtime.state, LifecycleState::Running);

        h.orch.shutdown_all().await;
        assert_eq!(h.orch.state("m1").state, LifecycleState::Stopped);
        assert_eq!(h.runtime.live(), 0);
    }
}
