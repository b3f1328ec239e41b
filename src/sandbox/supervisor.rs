//! Drives one execution from sandbox creation to teardown.
//!
//! The supervisor owns exactly one sandbox per call to
//! [`ExecutionSupervisor::execute`]. It feeds guest output into capped buffers
//! and the event bus, races completion against the deadline, and tears the
//! sandbox down on every exit path through a [`SandboxGuard`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Result, SandboxError};
use crate::sandbox::adapter::{exit_dropped, GuestRun, RuntimeAdapter, SandboxHandle};
use crate::sandbox::config::EngineConfig;
use crate::sandbox::diagnostics::parse_guest_diagnostic;
use crate::sandbox::events::{EventDispatcher, RequestEvents};
use crate::sandbox::governor::{SandboxRecord, SandboxRegistry};
use crate::sandbox::health::HealthMonitor;
use crate::sandbox::io::OutputCapture;
use crate::sandbox::profile::LanguageProfile;
use crate::sandbox::types::{
    ExecutionOutcome, ExecutionRequest, RequestId, KILLED_EXIT_CODE, TIMEOUT_EXIT_CODE,
};

/// How a released sandbox left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// The guard destroyed it.
    Destroyed,
    /// Engine shutdown took it and destroyed it first.
    Reclaimed,
}

/// Scoped owner of a live sandbox.
///
/// Registers the sandbox on creation. [`release`](Self::release) destroys it
/// within the grace period and deregisters it. If the guard is dropped
/// unreleased (an early return or a panic), destruction is scheduled on the
/// runtime instead. Either way the sandbox is destroyed only if the guard
/// still finds its record; shutdown may have taken it already.
pub struct SandboxGuard {
    adapter: Arc<dyn RuntimeAdapter>,
    handle: SandboxHandle,
    registry: SandboxRegistry,
    grace: Duration,
    released: bool,
}

impl SandboxGuard {
    pub fn new(
        adapter: Arc<dyn RuntimeAdapter>,
        handle: SandboxHandle,
        registry: SandboxRegistry,
        request: &ExecutionRequest,
        grace: Duration,
    ) -> Self {
        registry.register(
            handle.request_id(),
            SandboxRecord {
                runtime_id: handle.runtime_id().to_string(),
                session_id: request.session_id().clone(),
                language: handle.language(),
                limits: *handle.limits(),
                created_at: handle.created_at(),
            },
        );
        Self {
            adapter,
            handle,
            registry,
            grace,
            released: false,
        }
    }

    pub fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    /// Destroy the sandbox, waiting at most the grace period.
    ///
    /// The registry entry is restored if destruction fails so that shutdown
    /// can retry it.
    pub async fn release(mut self) -> Result<Teardown> {
        self.released = true;
        let request_id = self.handle.request_id();
        let Some(record) = self.registry.deregister(request_id) else {
            self.registry.take_reclaimed(request_id);
            return Ok(Teardown::Reclaimed);
        };

        let result = match tokio::time::timeout(self.grace, self.adapter.destroy(&self.handle)).await
        {
            Ok(result) => result,
            Err(_) => Err(SandboxError::runtime(format!(
                "destroy did not finish within {:?}",
                self.grace
            ))),
        };
        match result {
            Ok(()) => Ok(Teardown::Destroyed),
            Err(e) => {
                self.registry.register(request_id, record);
                Err(e)
            }
        }
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let request_id = self.handle.request_id();
        let Some(record) = self.registry.deregister(request_id) else {
            self.registry.take_reclaimed(request_id);
            return;
        };
        let adapter = Arc::clone(&self.adapter);
        let registry = self.registry.clone();
        let runtime_id = self.handle.runtime_id().to_string();
        tracing::warn!(%request_id, runtime_id = %runtime_id, "sandbox guard dropped; destroying in background");

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = adapter.destroy_runtime(&runtime_id).await {
                        tracing::error!(%request_id, error = %e, "background destroy failed");
                        registry.register(request_id, record);
                    }
                });
            }
            Err(_) => {
                tracing::error!(%request_id, "no runtime to destroy sandbox; left in registry");
                self.registry.register(request_id, record);
            }
        }
    }
}

/// Runs requests against one adapter, publishing their events.
#[derive(Clone)]
pub struct ExecutionSupervisor {
    config: Arc<EngineConfig>,
    adapter: Arc<dyn RuntimeAdapter>,
    dispatcher: EventDispatcher,
    registry: SandboxRegistry,
    health: HealthMonitor,
}

impl ExecutionSupervisor {
    pub fn new(
        config: Arc<EngineConfig>,
        adapter: Arc<dyn RuntimeAdapter>,
        dispatcher: EventDispatcher,
        registry: SandboxRegistry,
        health: HealthMonitor,
    ) -> Self {
        Self {
            config,
            adapter,
            dispatcher,
            registry,
            health,
        }
    }

    /// Smallest of the request budget, the language budget and the system maximum.
    pub fn effective_timeout(&self, request: &ExecutionRequest, profile: &LanguageProfile) -> Duration {
        Duration::from_millis(request.timeout_ms())
            .min(profile.timeout)
            .min(self.config.max_timeout)
    }

    /// Run `request` to completion, publishing exactly one terminal event.
    ///
    /// Sandbox creation and the guest run share one deadline, so the call
    /// returns within the effective timeout plus the teardown grace even when
    /// the substrate stalls.
    ///
    /// # Arguments
    ///
    /// * `request_id` - Id stamped on every event and on the sandbox
    /// * `request` - A request that already passed validation and admission
    ///
    /// # Returns
    ///
    /// The [`ExecutionOutcome`] for any guest that ran, including one that
    /// exited non-zero, was killed at its deadline, or was stopped by engine
    /// shutdown. An error only when the substrate itself failed.
    #[tracing::instrument(
        skip(self, request),
        fields(session = %request.session_id(), language = %request.language())
    )]
    pub async fn execute(
        &self,
        request_id: RequestId,
        request: &ExecutionRequest,
    ) -> Result<ExecutionOutcome> {
        let mut events = RequestEvents::new(
            self.dispatcher.clone(),
            request_id,
            request.session_id().clone(),
        );
        match self.supervise(request_id, request, &mut events).await {
            Ok(outcome) => {
                tracing::info!(
                    exit_code = outcome.exit_code,
                    duration_ms = outcome.duration_ms,
                    timed_out = outcome.timed_out,
                    truncated = outcome.truncated,
                    "execution completed"
                );
                events.complete(outcome.clone());
                Ok(outcome)
            }
            Err(e) => {
                if e.is_runtime_failure() {
                    tracing::error!(error = %e, adapter = self.adapter.name(), "execution failed");
                } else {
                    tracing::info!(error = %e, "execution failed");
                }
                events.fail(&e);
                Err(e)
            }
        }
    }

    async fn supervise(
        &self,
        request_id: RequestId,
        request: &ExecutionRequest,
        events: &mut RequestEvents,
    ) -> Result<ExecutionOutcome> {
        let language = request.language();
        let profile = self.config.profiles.get(language).ok_or_else(|| {
            SandboxError::Internal(format!("no profile for {language} after validation"))
        })?;
        let timeout = self.effective_timeout(request, profile);
        let deadline = tokio::time::Instant::now() + timeout;

        let created = tokio::time::timeout_at(
            deadline,
            self.adapter.create(profile, &profile.limits, request_id),
        )
        .await;
        let handle = match created {
            Ok(created) => created.inspect_err(|e| self.note_failure(e))?,
            Err(_) => {
                self.reap_abandoned(request_id);
                let e = SandboxError::runtime(format!(
                    "sandbox creation did not finish within {timeout:?}"
                ));
                self.note_failure(&e);
                return Err(e);
            }
        };
        let guard = SandboxGuard::new(
            Arc::clone(&self.adapter),
            handle,
            self.registry.clone(),
            request,
            self.config.teardown_grace,
        );

        events.started(language);
        let started = Instant::now();
        let (capture, exit) = self.drive(guard.handle(), request, deadline, events).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let teardown = guard.release().await;
        let reclaimed = match &teardown {
            Ok(Teardown::Destroyed) => false,
            Ok(Teardown::Reclaimed) => true,
            Err(e) => {
                tracing::error!(%request_id, error = %e, "sandbox teardown failed");
                self.health.record_failure();
                false
            }
        };

        let exit = match exit {
            // Shutdown destroyed the sandbox under a running guest.
            Err(e) if reclaimed => {
                tracing::info!(%request_id, error = %e, "guest stopped by engine shutdown");
                Ok(Some(KILLED_EXIT_CODE))
            }
            exit => exit,
        };
        let (exit_code, timed_out) = match exit.inspect_err(|e| self.note_failure(e))? {
            Some(code) => (code, false),
            None => {
                tracing::warn!(%request_id, timeout_ms = timeout.as_millis() as u64, "guest killed at deadline");
                (TIMEOUT_EXIT_CODE, true)
            }
        };
        if matches!(teardown, Ok(Teardown::Destroyed)) {
            self.health.record_success();
        }

        let stdout = capture.stdout.to_string_lossy();
        let stderr = capture.stderr.to_string_lossy();
        let diagnostic = if exit_code != 0 && !timed_out && !reclaimed {
            parse_guest_diagnostic(language, &stderr)
        } else {
            None
        };

        Ok(ExecutionOutcome {
            truncated: capture.is_truncated(),
            stdout,
            stderr,
            exit_code,
            duration_ms,
            timed_out,
            diagnostic,
        })
    }

    /// Stream output until the guest exits or the deadline passes.
    ///
    /// The exit code is `None` when the deadline won. Output captured before
    /// an adapter error is returned alongside it.
    async fn drive(
        &self,
        handle: &SandboxHandle,
        request: &ExecutionRequest,
        deadline: tokio::time::Instant,
        events: &mut RequestEvents,
    ) -> (OutputCapture, Result<Option<i64>>) {
        let mut capture =
            OutputCapture::new(self.config.stdout_cap_bytes, self.config.stderr_cap_bytes);

        let run = tokio::time::timeout_at(
            deadline,
            self.adapter.run(handle, request.source(), request.stdin()),
        )
        .await;
        let GuestRun { mut output, exit } = match run {
            Ok(Ok(run)) => run,
            Ok(Err(e)) => return (capture, Err(e)),
            Err(_) => return (capture, Ok(None)),
        };

        let completed = tokio::time::timeout_at(deadline, async {
            while let Some(chunk) = output.recv().await {
                let kept = capture.push(chunk.stream, &chunk.bytes);
                if !kept.is_empty() {
                    events.output(chunk.stream, kept);
                }
            }
            exit.await.unwrap_or_else(|_| Err(exit_dropped()))
        })
        .await;

        let exit = match completed {
            Ok(code) => code.map(Some),
            Err(_) => Ok(None),
        };
        (capture, exit)
    }

    /// Remove a sandbox the substrate may still produce after `create` was cancelled.
    fn reap_abandoned(&self, request_id: RequestId) {
        let adapter = Arc::clone(&self.adapter);
        let grace = self.config.teardown_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Err(e) = adapter.reap_request(request_id).await {
                tracing::error!(%request_id, error = %e, "failed to reap abandoned sandbox");
            }
        });
    }

    fn note_failure(&self, error: &SandboxError) {
        if error.is_runtime_failure() {
            self.health.record_failure();
        }
    }
}
