//! WebAssembly substrate: guests run inside a Wasmtime store with WASI preview 1.
//!
//! Isolation comes from the Wasm sandbox itself: no preopened directories, no
//! sockets, no inherited environment, and stdio backed by in-memory pipes.
//! Each sandbox has a kill flag that the shared epoch ticker checks, so a
//! destroyed sandbox traps at the next tick even in a tight loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use wasmtime::{Linker, Module, Store, UpdateDeadline};
use wasmtime_wasi::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{I32Exit, WasiCtxBuilder};

use super::{GuestRun, GuestSink, RuntimeAdapter, SandboxHandle, OUTPUT_CHANNEL_CAPACITY};
use crate::error::{Result, SandboxError};
use crate::sandbox::cache::{ModuleCache, SharedEngine};
use crate::sandbox::limits::{SandboxLimits, StoreLimiter};
use crate::sandbox::profile::LanguageProfile;
use crate::sandbox::types::{Language, OutputStream, RequestId, KILLED_EXIT_CODE};

const DEFAULT_EPOCH_TICK: Duration = Duration::from_millis(10);
const DEFAULT_PIPE_CAPACITY: usize = 1024 * 1024;
const CHUNK_SIZE: usize = 8 * 1024;

/// An interpreter module and the argv that precedes the guest source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WasmModule {
    pub path: PathBuf,
    pub args: Vec<String>,
}

impl WasmModule {
    /// RustPython compiled to WASI, run as `python -c <source>`.
    pub fn rustpython(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            args: vec!["python".to_string(), "-c".to_string()],
        }
    }
}

struct StoreData {
    limiter: StoreLimiter,
    wasi: WasiP1Ctx,
}

struct WasmSandbox {
    module: Arc<Module>,
    args: Vec<String>,
    memory_bytes: u64,
    killed: Arc<AtomicBool>,
}

/// Runs guests in Wasmtime stores on the blocking thread pool.
pub struct WasmAdapter {
    engine: SharedEngine,
    cache: Arc<ModuleCache>,
    modules: HashMap<Language, WasmModule>,
    sandboxes: Mutex<HashMap<String, WasmSandbox>>,
    pipe_capacity: usize,
    ticker: JoinHandle<()>,
}

impl std::fmt::Debug for WasmAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmAdapter")
            .field("engine", &self.engine)
            .field("modules", &self.modules)
            .field("pipe_capacity", &self.pipe_capacity)
            .finish_non_exhaustive()
    }
}

impl WasmAdapter {
    /// Create an adapter on a fresh engine.
    ///
    /// Must be called from within a Tokio runtime, which drives the epoch ticker.
    pub fn new() -> Result<Self> {
        Self::with_engine(SharedEngine::new()?, DEFAULT_EPOCH_TICK)
    }

    /// Create an adapter on `engine`, advancing its epoch every `tick`.
    pub fn with_engine(engine: SharedEngine, tick: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            SandboxError::Config("the wasm adapter needs a running Tokio runtime".to_string())
        })?;

        let ticker_engine = engine.arc();
        let ticker = runtime.spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                ticker_engine.increment_epoch();
            }
        });

        Ok(Self {
            engine,
            cache: Arc::new(ModuleCache::new()),
            modules: HashMap::new(),
            sandboxes: Mutex::new(HashMap::new()),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            ticker,
        })
    }

    /// Enable `language` using `module`.
    pub fn with_module(mut self, language: Language, module: WasmModule) -> Self {
        self.modules.insert(language, module);
        self
    }

    /// Share a module cache with other adapters.
    pub fn with_cache(mut self, cache: Arc<ModuleCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Maximum bytes buffered per output stream inside the store.
    pub fn with_pipe_capacity(mut self, bytes: usize) -> Self {
        self.pipe_capacity = bytes;
        self
    }

    /// Number of sandboxes created and not yet destroyed.
    pub fn live_sandboxes(&self) -> usize {
        self.sandboxes().len()
    }

    fn sandboxes(&self) -> MutexGuard<'_, HashMap<String, WasmSandbox>> {
        self.sandboxes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn module_for(&self, profile: &LanguageProfile) -> Result<WasmModule> {
        if let Some(module) = self.modules.get(&profile.language) {
            return Ok(module.clone());
        }
        if profile.language == Language::Python && profile.image.ends_with(".wasm") {
            return Ok(WasmModule::rustpython(&profile.image));
        }
        Err(SandboxError::Config(format!(
            "no wasm module configured for {}",
            profile.language
        )))
    }
}

impl Drop for WasmAdapter {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

struct GuestExit {
    code: i64,
    stdout: Bytes,
    stderr: Bytes,
}

fn execute_sync(
    engine: &wasmtime::Engine,
    sandbox: &WasmSandbox,
    source: &str,
    stdin: Option<&str>,
    pipe_capacity: usize,
) -> Result<GuestExit> {
    let stdout = MemoryOutputPipe::new(pipe_capacity);
    let stderr = MemoryOutputPipe::new(pipe_capacity);
    let stdin = MemoryInputPipe::new(Bytes::copy_from_slice(
        stdin.unwrap_or_default().as_bytes(),
    ));

    let mut args = sandbox.args.clone();
    args.push(source.to_string());

    // No preopens, no env, no sockets.
    let wasi = WasiCtxBuilder::new()
        .args(&args)
        .stdin(stdin)
        .stdout(stdout.clone())
        .stderr(stderr.clone())
        .build_p1();

    let mut store = Store::new(
        engine,
        StoreData {
            limiter: StoreLimiter::new(sandbox.memory_bytes),
            wasi,
        },
    );
    store.limiter(|data| &mut data.limiter);

    let killed = Arc::clone(&sandbox.killed);
    store.set_epoch_deadline(1);
    store.epoch_deadline_callback(move |_| {
        if killed.load(Ordering::SeqCst) {
            anyhow::bail!("sandbox destroyed");
        }
        Ok(UpdateDeadline::Continue(1))
    });

    let mut linker = Linker::new(engine);
    preview1::add_to_linker_sync(&mut linker, |data: &mut StoreData| &mut data.wasi)
        .map_err(SandboxError::RuntimeFailure)?;

    let instance = linker
        .instantiate(&mut store, &sandbox.module)
        .map_err(|e| SandboxError::RuntimeFailure(e.context("failed to instantiate module")))?;
    let start = instance
        .get_typed_func::<(), ()>(&mut store, "_start")
        .map_err(SandboxError::RuntimeFailure)?;

    let mut trap_message = None;
    let code = match start.call(&mut store, ()) {
        Ok(()) => 0,
        Err(e) => {
            if let Some(exit) = e.downcast_ref::<I32Exit>() {
                i64::from(exit.0)
            } else if store.data().limiter.limit_exceeded() {
                trap_message = Some("memory limit exceeded".to_string());
                KILLED_EXIT_CODE
            } else if sandbox.killed.load(Ordering::SeqCst) {
                trap_message = Some("killed".to_string());
                KILLED_EXIT_CODE
            } else {
                // Guest traps (unreachable, stack overflow) are guest failures.
                trap_message = Some(format!("{e:#}"));
                1
            }
        }
    };
    drop(store);

    let mut stderr = stderr.contents();
    if let Some(message) = trap_message {
        let mut combined = stderr.to_vec();
        if !combined.is_empty() && !combined.ends_with(b"\n") {
            combined.push(b'\n');
        }
        combined.extend_from_slice(message.as_bytes());
        combined.push(b'\n');
        stderr = Bytes::from(combined);
    }

    Ok(GuestExit {
        code,
        stdout: stdout.contents(),
        stderr,
    })
}

fn forward(sink: &GuestSink, stream: OutputStream, mut data: Bytes) -> bool {
    while !data.is_empty() {
        let chunk = data.split_to(data.len().min(CHUNK_SIZE));
        if !sink.blocking_send(stream, chunk) {
            return false;
        }
    }
    true
}

#[async_trait]
impl RuntimeAdapter for WasmAdapter {
    #[tracing::instrument(skip_all, fields(language = %profile.language, request_id = %request_id))]
    async fn create(
        &self,
        profile: &LanguageProfile,
        limits: &SandboxLimits,
        request_id: RequestId,
    ) -> Result<SandboxHandle> {
        let WasmModule { path, args } = self.module_for(profile)?;
        let engine = self.engine.clone();
        let cache = Arc::clone(&self.cache);
        let module = tokio::task::spawn_blocking(move || cache.get_or_compile(&engine, path))
            .await
            .map_err(|e| SandboxError::Internal(format!("module compilation panicked: {e}")))??;

        // Registered only after compilation, so a cancelled create leaves nothing behind.
        let runtime_id = uuid::Uuid::new_v4().to_string();
        self.sandboxes().insert(
            runtime_id.clone(),
            WasmSandbox {
                module,
                args,
                memory_bytes: limits.memory_bytes,
                killed: Arc::new(AtomicBool::new(false)),
            },
        );
        tracing::debug!(runtime_id = %runtime_id, "wasm sandbox created");

        Ok(SandboxHandle::new(
            runtime_id,
            request_id,
            profile.language,
            *limits,
        ))
    }

    #[tracing::instrument(skip_all, fields(runtime_id = %handle.runtime_id()))]
    async fn run(
        &self,
        handle: &SandboxHandle,
        source: &str,
        stdin: Option<&str>,
    ) -> Result<GuestRun> {
        let sandbox = {
            let sandboxes = self.sandboxes();
            let entry = sandboxes
                .get(handle.runtime_id())
                .ok_or_else(|| SandboxError::runtime("sandbox was already destroyed"))?;
            WasmSandbox {
                module: Arc::clone(&entry.module),
                args: entry.args.clone(),
                memory_bytes: entry.memory_bytes,
                killed: Arc::clone(&entry.killed),
            }
        };

        let (sink, run) = GuestRun::channel(OUTPUT_CHANNEL_CAPACITY);
        let engine = self.engine.clone();
        let source = source.to_string();
        let stdin = stdin.map(str::to_string);
        let pipe_capacity = self.pipe_capacity;

        tokio::task::spawn_blocking(move || {
            match execute_sync(&engine, &sandbox, &source, stdin.as_deref(), pipe_capacity) {
                Ok(exit) => {
                    if forward(&sink, OutputStream::Stdout, exit.stdout) {
                        forward(&sink, OutputStream::Stderr, exit.stderr);
                    }
                    sink.finish(Ok(exit.code));
                }
                Err(e) => sink.finish(Err(e)),
            }
        });
        Ok(run)
    }

    async fn destroy_runtime(&self, runtime_id: &str) -> Result<()> {
        if let Some(sandbox) = self.sandboxes().remove(runtime_id) {
            sandbox.killed.store(true, Ordering::SeqCst);
            tracing::debug!(runtime_id, "wasm sandbox destroyed");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "wasm"
    }
}
