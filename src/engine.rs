//! The engine facade: validation, admission, supervision and fan-out wired together.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Result, SandboxError};
use crate::sandbox::adapter::RuntimeAdapter;
use crate::sandbox::config::EngineConfig;
use crate::sandbox::events::{EventDispatcher, RequestEvents, Subscription};
use crate::sandbox::governor::{ConcurrencyGovernor, GovernorStats, SandboxRecord};
use crate::sandbox::health::{HealthMonitor, HealthStatus};
use crate::sandbox::supervisor::ExecutionSupervisor;
use crate::sandbox::types::{ExecutionOutcome, ExecutionRequest, RequestId};
use crate::sandbox::validator::RequestValidator;

/// A submitted request: its id, its event subscription and its eventual outcome.
#[derive(Debug)]
pub struct PendingExecution {
    id: RequestId,
    /// Subscribed before admission, so it carries the full event history.
    pub events: Subscription,
    task: JoinHandle<Result<ExecutionOutcome>>,
}

impl PendingExecution {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the outcome.
    pub async fn outcome(self) -> Result<ExecutionOutcome> {
        self.task
            .await
            .map_err(|e| SandboxError::Internal(format!("execution task failed: {e}")))?
    }

    /// Split into the subscription and the outcome future.
    pub fn into_parts(self) -> (RequestId, Subscription, JoinHandle<Result<ExecutionOutcome>>) {
        (self.id, self.events, self.task)
    }
}

/// Sandboxed multi-language execution engine.
///
/// # Example
///
/// ```rust,ignore
/// use code_sandbox_engine::prelude::*;
/// use std::sync::Arc;
///
/// let adapter = Arc::new(DockerAdapter::connect()?);
/// let engine = ExecutionEngine::new(EngineConfig::from_env()?, adapter)?;
///
/// let request = ExecutionRequest::new(Language::Python, "print('hi')", SessionId::new("s1"));
/// let outcome = engine.execute(request).await?;
/// assert_eq!(outcome.stdout, "hi\n");
/// ```
pub struct ExecutionEngine {
    config: Arc<EngineConfig>,
    validator: RequestValidator,
    governor: ConcurrencyGovernor,
    dispatcher: EventDispatcher,
    health: HealthMonitor,
    adapter: Arc<dyn RuntimeAdapter>,
    supervisor: ExecutionSupervisor,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("adapter", &self.adapter.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ExecutionEngine {
    /// Wire an engine around `adapter`.
    pub fn new(config: EngineConfig, adapter: Arc<dyn RuntimeAdapter>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let validator = RequestValidator::new(config.max_source_bytes, &config.profiles);
        let governor = ConcurrencyGovernor::new(config.governor_limits());
        let dispatcher = EventDispatcher::new(config.event_buffer);
        let health =
            HealthMonitor::with_retry_interval(config.failure_threshold, config.health_retry_interval);
        let supervisor = ExecutionSupervisor::new(
            Arc::clone(&config),
            Arc::clone(&adapter),
            dispatcher.clone(),
            governor.registry().clone(),
            health.clone(),
        );

        tracing::info!(
            adapter = adapter.name(),
            max_concurrent = config.max_concurrent,
            max_per_session = config.max_per_session,
            languages = ?config.profiles.languages().collect::<Vec<_>>(),
            "execution engine ready"
        );

        Ok(Self {
            config,
            validator,
            governor,
            dispatcher,
            health,
            adapter,
            supervisor,
        })
    }

    /// Validate and admit `request`, then run it on a background task.
    ///
    /// Validation, health and per-session checks fail here, before any task is
    /// spawned. Queue timeouts and runtime failures surface through
    /// [`PendingExecution::outcome`]. Every path that reaches the event bus
    /// ends with exactly one terminal event.
    pub fn submit(&self, request: ExecutionRequest) -> Result<PendingExecution> {
        let id = RequestId::new();
        let events = self.dispatcher.subscribe(Some(id));

        if let Err(e) = self.preflight(&request) {
            RequestEvents::new(self.dispatcher.clone(), id, request.session_id().clone()).fail(&e);
            return Err(e);
        }

        let ticket = match self.governor.admit(&request, id) {
            Ok(ticket) => ticket,
            Err(e) => {
                tracing::info!(request_id = %id, error = %e, "admission refused");
                RequestEvents::new(self.dispatcher.clone(), id, request.session_id().clone())
                    .fail(&e);
                return Err(e);
            }
        };

        let supervisor = self.supervisor.clone();
        let dispatcher = self.dispatcher.clone();
        let task = tokio::spawn(async move {
            let permit = match ticket.wait().await {
                Ok(permit) => permit,
                Err(e) => {
                    RequestEvents::new(dispatcher, id, request.session_id().clone()).fail(&e);
                    return Err(e);
                }
            };
            tracing::debug!(request_id = %id, waited_ms = permit.waited().as_millis() as u64, "admitted");
            let outcome = supervisor.execute(id, &request).await;
            permit.release();
            outcome
        });

        Ok(PendingExecution { id, events, task })
    }

    /// Submit and wait for the outcome.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome> {
        self.submit(request)?.outcome().await
    }

    /// Subscribe to events of one request, or of all requests.
    pub fn subscribe(&self, request_id: Option<RequestId>) -> Subscription {
        self.dispatcher.subscribe(request_id)
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn health(&self) -> HealthStatus {
        self.health.status()
    }

    pub fn health_watch(&self) -> watch::Receiver<HealthStatus> {
        self.health.watch()
    }

    /// Ask the adapter whether its substrate answers and fold the answer into health.
    ///
    /// Lets an operator restore an unhealthy engine without waiting for a
    /// retry request.
    pub async fn check_health(&self) -> HealthStatus {
        match self.adapter.health_check().await {
            Ok(()) => self.health.record_success(),
            Err(e) => {
                tracing::warn!(adapter = self.adapter.name(), error = %e, "health check failed");
                self.health.record_failure();
            }
        }
        self.health.status()
    }

    pub fn stats(&self) -> GovernorStats {
        self.governor.stats()
    }

    /// Snapshot of sandboxes currently alive.
    pub fn active_sandboxes(&self) -> Vec<(RequestId, SandboxRecord)> {
        self.governor.registry().snapshot()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stop admitting requests and destroy every sandbox still registered.
    ///
    /// Each sandbox is taken out of the registry before it is destroyed, so
    /// its supervisor does not destroy it a second time and reports the guest
    /// as killed rather than as a substrate fault. Returns the number of
    /// sandboxes destroyed.
    pub async fn shutdown(&self) -> Result<usize> {
        self.governor.close();
        let registry = self.governor.registry();
        let mut destroyed = 0;
        let mut first_error = None;

        for (request_id, _) in registry.snapshot() {
            // Its supervisor may have released it since the snapshot.
            let Some(record) = registry.reclaim(request_id) else {
                continue;
            };
            match self.adapter.destroy_runtime(&record.runtime_id).await {
                Ok(()) => destroyed += 1,
                Err(e) => {
                    tracing::error!(%request_id, runtime_id = %record.runtime_id, error = %e, "shutdown destroy failed");
                    registry.register(request_id, record);
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::info!(destroyed, "execution engine shut down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(destroyed),
        }
    }

    fn preflight(&self, request: &ExecutionRequest) -> Result<()> {
        if let Err(rejection) = self.validator.validate(request) {
            tracing::info!(
                session = %request.session_id(),
                language = %request.language(),
                %rejection,
                "request rejected"
            );
            return Err(rejection.into());
        }

        // Checked after validation so a retry is never spent on a rejected request.
        if !self.health.allow_request() {
            return Err(SandboxError::runtime(format!(
                "{} substrate is unhealthy",
                self.adapter.name()
            )));
        }

        for warning in self.validator.warnings(request) {
            tracing::warn!(
                session = %request.session_id(),
                pattern = %warning.pattern,
                "{}",
                warning.message
            );
        }
        Ok(())
    }
}
