//! Scripted in-memory adapter for engine tests.
//!
//! Counts every create/destroy call and tracks which sandboxes are still
//! alive, so tests can assert on teardown without a real substrate.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use code_sandbox_engine::sandbox::profile::LanguageProfile;
use code_sandbox_engine::{
    GuestRun, OutputStream, RequestId, Result, RuntimeAdapter, SandboxError, SandboxHandle,
    SandboxLimits,
};

/// What the guest does once `run` is called.
#[derive(Debug, Clone)]
pub enum Script {
    /// Write the chunks, then exit with the code.
    Exit {
        output: Vec<(OutputStream, Vec<u8>)>,
        code: i64,
    },
    /// Write the chunks, then never exit until destroyed.
    Hang { output: Vec<(OutputStream, Vec<u8>)> },
    /// Exit with the code after sleeping.
    Slow { delay: Duration, code: i64 },
    /// `create` fails with a runtime failure.
    CreateFails,
    /// `create` reports that the host is out of resources.
    CreateExhausted,
    /// `create` never returns.
    CreateHangs,
    /// `run` fails with a runtime failure.
    RunFails,
    /// `run` panics.
    RunPanics,
}

impl Script {
    pub fn prints(text: &str) -> Self {
        Script::Exit {
            output: vec![(OutputStream::Stdout, text.as_bytes().to_vec())],
            code: 0,
        }
    }

    pub fn crashes(stderr: &str, code: i64) -> Self {
        Script::Exit {
            output: vec![(OutputStream::Stderr, stderr.as_bytes().to_vec())],
            code,
        }
    }

    pub fn hangs() -> Self {
        Script::Hang { output: Vec::new() }
    }
}

#[derive(Debug, Default)]
struct Counters {
    creates: AtomicUsize,
    destroys: AtomicUsize,
    runs: AtomicUsize,
    reaps: AtomicUsize,
}

/// An adapter whose guests follow a [`Script`].
#[derive(Clone)]
pub struct MockAdapter {
    script: Arc<Mutex<Script>>,
    counters: Arc<Counters>,
    live: Arc<Mutex<HashSet<String>>>,
    destroyed_ids: Arc<Mutex<Vec<String>>>,
    // Runtime id -> its pending guest task, aborted on destroy.
    guests: Arc<Mutex<Vec<(String, tokio::task::AbortHandle)>>>,
}

impl MockAdapter {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            counters: Arc::new(Counters::default()),
            live: Arc::new(Mutex::new(HashSet::new())),
            destroyed_ids: Arc::new(Mutex::new(Vec::new())),
            guests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn creates(&self) -> usize {
        self.counters.creates.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.counters.destroys.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.counters.runs.load(Ordering::SeqCst)
    }

    /// Calls to `reap_request`.
    pub fn reaps(&self) -> usize {
        self.counters.reaps.load(Ordering::SeqCst)
    }

    /// Sandboxes created and not yet destroyed.
    pub fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    /// How many times `runtime_id` was destroyed.
    pub fn destroy_count(&self, runtime_id: &str) -> usize {
        self.destroyed_ids
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == runtime_id)
            .count()
    }

    /// Wait until `reap_request` has been called, or the timeout passes.
    pub async fn wait_for_reap(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.reaps() > 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.reaps() > 0
    }

    /// Wait until every sandbox is gone, or the timeout passes.
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.live() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.live() == 0
    }
}

#[async_trait]
impl RuntimeAdapter for MockAdapter {
    async fn create(
        &self,
        profile: &LanguageProfile,
        limits: &SandboxLimits,
        request_id: RequestId,
    ) -> Result<SandboxHandle> {
        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().unwrap().clone();
        match script {
            Script::CreateFails => return Err(SandboxError::runtime("daemon unreachable")),
            Script::CreateExhausted => {
                return Err(SandboxError::ResourceExhausted("out of memory".into()))
            }
            Script::CreateHangs => std::future::pending::<()>().await,
            _ => {}
        }
        let runtime_id = format!("mock-{request_id}");
        self.live.lock().unwrap().insert(runtime_id.clone());
        Ok(SandboxHandle::new(
            runtime_id,
            request_id,
            profile.language,
            *limits,
        ))
    }

    async fn run(
        &self,
        handle: &SandboxHandle,
        _source: &str,
        _stdin: Option<&str>,
    ) -> Result<GuestRun> {
        self.counters.runs.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().unwrap().clone();
        let (sink, run) = GuestRun::channel(16);

        let guest = match script {
            Script::RunFails => return Err(SandboxError::runtime("attach failed")),
            Script::RunPanics => panic!("adapter bug"),
            Script::CreateFails | Script::CreateExhausted | Script::CreateHangs => unreachable!(),
            Script::Exit { output, code } => tokio::spawn(async move {
                for (stream, bytes) in output {
                    sink.send(stream, bytes).await;
                }
                sink.finish(Ok(code));
            }),
            Script::Hang { output } => tokio::spawn(async move {
                for (stream, bytes) in output {
                    sink.send(stream, bytes).await;
                }
                std::future::pending::<()>().await;
                drop(sink);
            }),
            Script::Slow { delay, code } => tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                sink.finish(Ok(code));
            }),
        };
        self.guests
            .lock()
            .unwrap()
            .push((handle.runtime_id().to_string(), guest.abort_handle()));
        Ok(run)
    }

    async fn destroy_runtime(&self, runtime_id: &str) -> Result<()> {
        self.counters.destroys.fetch_add(1, Ordering::SeqCst);
        self.destroyed_ids.lock().unwrap().push(runtime_id.to_string());
        self.live.lock().unwrap().remove(runtime_id);
        self.guests.lock().unwrap().retain(|(id, guest)| {
            if id == runtime_id {
                guest.abort();
                false
            } else {
                true
            }
        });
        Ok(())
    }

    async fn reap_request(&self, _request_id: RequestId) -> Result<usize> {
        self.counters.reaps.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Install a test subscriber once; respects `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
