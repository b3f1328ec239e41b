//! # Code Sandbox Engine
//!
//! Runs untrusted source code in Python, JavaScript, Java or C++ inside an
//! isolated, resource-constrained sandbox and reports the result as a bounded,
//! deterministic [`ExecutionOutcome`] plus a stream of lifecycle events.
//!
//! A request flows through five components:
//!
//! - **Request validator**: static size, language and deny-list checks
//! - **Concurrency governor**: global and per-session ceilings with a FIFO queue
//! - **Execution supervisor**: drives one sandbox, enforces the deadline and
//!   always tears the sandbox down
//! - **Runtime adapter**: the isolation substrate (Docker containers or Wasmtime)
//! - **Event dispatcher**: fan-out of `Started`, `OutputChunk` and a single
//!   terminal `Completed` or `Failed` event per request
//!
//! ## Example
//!
//! ```rust,ignore
//! use code_sandbox_engine::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let adapter = Arc::new(DockerAdapter::connect()?);
//!     let engine = ExecutionEngine::new(EngineConfig::from_env()?, adapter)?;
//!
//!     let request = ExecutionRequest::new(Language::Python, "print('hi')", SessionId::new("s1"))
//!         .with_timeout_ms(5_000);
//!     let outcome = engine.execute(request).await?;
//!
//!     assert_eq!(outcome.stdout, "hi\n");
//!     assert!(outcome.is_success());
//!     Ok(())
//! }
//! ```
//!
//! ## Security Model
//!
//! The deny-list is a cost-saving filter; isolation is the boundary:
//!
//! 1. **Containers**: no network, read-only root, a small `noexec` tmpfs,
//!    unprivileged user, no capabilities, pids/memory/CPU/ulimit ceilings
//! 2. **Wasm**: no preopened directories or sockets, memory limiter, and a
//!    kill flag checked on every epoch tick
//! 3. **Deadlines**: every guest is killed at its wall-clock budget and its
//!    sandbox destroyed within a grace period

pub mod engine;
pub mod error;
pub mod prelude;
pub mod sandbox;

pub use engine::{ExecutionEngine, PendingExecution};
pub use error::{ErrorKind, Result, SandboxError};
pub use sandbox::adapter::{GuestRun, GuestSink, OutputChunk, RuntimeAdapter, SandboxHandle};
pub use sandbox::audit::spawn_audit_logger;
pub use sandbox::config::{EngineConfig, EngineConfigBuilder};
pub use sandbox::diagnostics::GuestDiagnostic;
pub use sandbox::events::{
    Delivery, EventDispatcher, EventEnvelope, ExecutionEvent, RequestEvents, Subscription,
};
pub use sandbox::governor::{ConcurrencyGovernor, GovernorStats, SandboxRecord};
pub use sandbox::health::{HealthMonitor, HealthStatus};
pub use sandbox::limits::SandboxLimits;
pub use sandbox::profile::{LanguageProfile, ProfileRegistry};
pub use sandbox::types::{
    ExecutionOutcome, ExecutionRequest, Language, OutputStream, RequestId, SessionId,
    KILLED_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
pub use sandbox::validator::{Rejection, RejectionReason, RequestValidator};

#[cfg(feature = "docker")]
pub use sandbox::adapter::DockerAdapter;
#[cfg(feature = "wasm")]
pub use sandbox::adapter::WasmAdapter;
#[cfg(feature = "wasm")]
pub use sandbox::cache::{ModuleCache, SharedEngine};
