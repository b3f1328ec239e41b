//! Prelude module for convenient imports.

pub use crate::engine::{ExecutionEngine, PendingExecution};
pub use crate::error::{ErrorKind, Result, SandboxError};
pub use crate::sandbox::{
    adapter::RuntimeAdapter,
    config::EngineConfig,
    events::{Delivery, ExecutionEvent},
    types::{ExecutionOutcome, ExecutionRequest, Language, SessionId},
};

#[cfg(feature = "docker")]
pub use crate::sandbox::adapter::DockerAdapter;
#[cfg(feature = "wasm")]
pub use crate::sandbox::adapter::{wasm::WasmModule, WasmAdapter};
