//! Uniform interface to the isolation substrates.
//!
//! A [`RuntimeAdapter`] creates one isolated environment per request, runs a
//! guest program in it while streaming its output, and destroys it. The
//! supervisor only talks to this trait, so the substrate is pluggable.

#[cfg(feature = "docker")]
pub mod docker;
#[cfg(feature = "wasm")]
pub mod wasm;

use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, SandboxError};
use crate::sandbox::limits::SandboxLimits;
use crate::sandbox::profile::LanguageProfile;
use crate::sandbox::types::{Language, OutputStream, RequestId};

#[cfg(feature = "docker")]
pub use docker::DockerAdapter;
#[cfg(feature = "wasm")]
pub use wasm::WasmAdapter;

/// Capacity of the output channel between an adapter and its supervisor.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// One live isolated environment.
///
/// Handles are exclusively owned by the supervisor that created them and are
/// deliberately not `Clone`.
#[derive(Debug)]
pub struct SandboxHandle {
    runtime_id: String,
    request_id: RequestId,
    language: Language,
    limits: SandboxLimits,
    created_at: SystemTime,
}

impl SandboxHandle {
    pub fn new(
        runtime_id: impl Into<String>,
        request_id: RequestId,
        language: Language,
        limits: SandboxLimits,
    ) -> Self {
        Self {
            runtime_id: runtime_id.into(),
            request_id,
            language,
            limits,
            created_at: SystemTime::now(),
        }
    }

    /// Substrate-specific identifier (container id, store key).
    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }
}

/// A piece of guest output as read from the substrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub bytes: Bytes,
}

/// A running guest: its output stream and, once it exits, its exit code.
///
/// The output channel closes before the exit status resolves.
#[derive(Debug)]
pub struct GuestRun {
    pub output: mpsc::Receiver<OutputChunk>,
    pub exit: oneshot::Receiver<Result<i64>>,
}

impl GuestRun {
    /// Create a run and the sink an adapter feeds it from.
    pub fn channel(capacity: usize) -> (GuestSink, GuestRun) {
        let (output_tx, output_rx) = mpsc::channel(capacity.max(1));
        let (exit_tx, exit_rx) = oneshot::channel();
        (
            GuestSink {
                output: output_tx,
                exit: exit_tx,
            },
            GuestRun {
                output: output_rx,
                exit: exit_rx,
            },
        )
    }
}

/// Producer side of a [`GuestRun`].
#[derive(Debug)]
pub struct GuestSink {
    output: mpsc::Sender<OutputChunk>,
    exit: oneshot::Sender<Result<i64>>,
}

impl GuestSink {
    /// Forward a chunk. Returns `false` once the supervisor stopped listening.
    pub async fn send(&self, stream: OutputStream, bytes: impl Into<Bytes>) -> bool {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return true;
        }
        self.output
            .send(OutputChunk { stream, bytes })
            .await
            .is_ok()
    }

    /// Blocking variant of [`send`](Self::send) for substrates driven from a
    /// blocking thread.
    pub fn blocking_send(&self, stream: OutputStream, bytes: impl Into<Bytes>) -> bool {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return true;
        }
        self.output
            .blocking_send(OutputChunk { stream, bytes })
            .is_ok()
    }

    /// Close the output stream and report how the guest ended.
    pub fn finish(self, exit: Result<i64>) {
        drop(self.output);
        let _ = self.exit.send(exit);
    }
}

/// An isolation substrate.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Create (but do not start) an isolated environment bounded by `limits`.
    ///
    /// Fails with [`SandboxError::ResourceExhausted`] when the host cannot
    /// satisfy the limits, and [`SandboxError::RuntimeFailure`] on substrate
    /// faults.
    async fn create(
        &self,
        profile: &LanguageProfile,
        limits: &SandboxLimits,
        request_id: RequestId,
    ) -> Result<SandboxHandle>;

    /// Start the guest with `source` and optional `stdin`.
    ///
    /// A non-zero guest exit is reported through [`GuestRun::exit`], never as
    /// an error here.
    async fn run(
        &self,
        handle: &SandboxHandle,
        source: &str,
        stdin: Option<&str>,
    ) -> Result<GuestRun>;

    /// Kill every process of the sandbox and release its resources.
    async fn destroy(&self, handle: &SandboxHandle) -> Result<()> {
        self.destroy_runtime(handle.runtime_id()).await
    }

    /// Destroy by runtime id. Idempotent: an unknown id is success.
    async fn destroy_runtime(&self, runtime_id: &str) -> Result<()>;

    /// Destroy whatever an abandoned `create` for `request_id` left behind.
    ///
    /// Called when `create` was cancelled at its deadline and the substrate
    /// may still finish the work. Returns how many sandboxes were removed.
    async fn reap_request(&self, _request_id: RequestId) -> Result<usize> {
        Ok(0)
    }

    /// Cheap liveness check of the substrate itself.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    /// Short substrate name for logs.
    fn name(&self) -> &str;
}

/// Map an exit-status channel that closed without a value.
pub(crate) fn exit_dropped() -> SandboxError {
    SandboxError::runtime("guest exit status was never reported")
}
