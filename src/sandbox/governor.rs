//! Admission control and the registry of live sandboxes.
//!
//! The governor is the only component that reasons about aggregate capacity.
//! Supervisors only ever see their own sandbox.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::error::{Result, SandboxError};
use crate::sandbox::limits::SandboxLimits;
use crate::sandbox::types::{ExecutionRequest, Language, RequestId, SessionId};

/// Bookkeeping for one live sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxRecord {
    pub runtime_id: String,
    pub session_id: SessionId,
    pub language: Language,
    pub limits: SandboxLimits,
    pub created_at: SystemTime,
}

/// Arena of live sandboxes keyed by the request that owns them.
///
/// Removing a record is what grants the right to destroy its sandbox, so a
/// sandbox is destroyed by exactly one party: its supervisor or shutdown.
#[derive(Debug, Clone, Default)]
pub struct SandboxRegistry {
    records: Arc<Mutex<Records>>,
}

#[derive(Debug, Default)]
struct Records {
    live: HashMap<RequestId, SandboxRecord>,
    // Taken by shutdown; the owning supervisor has not noticed yet.
    reclaimed: HashSet<RequestId>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: RequestId, record: SandboxRecord) {
        let mut records = self.lock();
        records.reclaimed.remove(&request_id);
        records.live.insert(request_id, record);
    }

    /// Remove the record. `Some` means the caller now owns destruction.
    pub fn deregister(&self, request_id: RequestId) -> Option<SandboxRecord> {
        self.lock().live.remove(&request_id)
    }

    /// Take the record away from its supervisor on behalf of shutdown.
    ///
    /// The supervisor learns about it through [`take_reclaimed`](Self::take_reclaimed).
    pub fn reclaim(&self, request_id: RequestId) -> Option<SandboxRecord> {
        let mut records = self.lock();
        let record = records.live.remove(&request_id)?;
        records.reclaimed.insert(request_id);
        Some(record)
    }

    /// Whether shutdown reclaimed this request's sandbox. Clears the mark.
    pub fn take_reclaimed(&self, request_id: RequestId) -> bool {
        self.lock().reclaimed.remove(&request_id)
    }

    pub fn get(&self, request_id: RequestId) -> Option<SandboxRecord> {
        self.lock().live.get(&request_id).cloned()
    }

    /// Snapshot of every registered sandbox.
    pub fn snapshot(&self) -> Vec<(RequestId, SandboxRecord)> {
        self.lock()
            .live
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Ceilings enforced by the governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorLimits {
    pub max_concurrent: usize,
    pub max_per_session: usize,
    pub queue_timeout: Duration,
    pub max_queue_depth: usize,
}

/// Point-in-time admission counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GovernorStats {
    pub running: usize,
    pub queued: usize,
    pub max_concurrent: usize,
}

/// Bounds concurrent sandboxes globally and per session.
#[derive(Debug, Clone)]
pub struct ConcurrencyGovernor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    limits: GovernorLimits,
    // Fair semaphore: waiters are served in FIFO order.
    slots: Arc<Semaphore>,
    sessions: Mutex<HashMap<SessionId, usize>>,
    // Tickets issued by `admit` that do not hold a slot yet.
    pending: AtomicUsize,
    closed: AtomicBool,
    registry: SandboxRegistry,
}

impl ConcurrencyGovernor {
    pub fn new(limits: GovernorLimits) -> Self {
        Self {
            inner: Arc::new(Inner {
                limits,
                slots: Arc::new(Semaphore::new(limits.max_concurrent)),
                sessions: Mutex::new(HashMap::new()),
                pending: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                registry: SandboxRegistry::new(),
            }),
        }
    }

    /// Take a place in line for `request`.
    ///
    /// The per-session ceiling (queued plus running) and the queue depth are
    /// both checked here, and a violation is rejected at once without ever
    /// being queued. The place in line is reserved before this returns, so a
    /// burst of calls cannot overrun the queue before any ticket is awaited.
    ///
    /// # Arguments
    ///
    /// * `request` - The request asking for a slot; only its session is read
    /// * `request_id` - Id carried by the ticket and the eventual permit
    ///
    /// # Returns
    ///
    /// A [`QueueTicket`] to resolve with [`QueueTicket::wait`], or
    /// [`SandboxError::SessionConcurrencyExceeded`] and
    /// [`SandboxError::ResourceExhausted`] (queue full or shutting down).
    pub fn admit(&self, request: &ExecutionRequest, request_id: RequestId) -> Result<QueueTicket> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SandboxError::ResourceExhausted(
                "engine is shutting down".to_string(),
            ));
        }

        let limits = self.inner.limits;
        let session = request.session_id().clone();
        {
            // The sessions lock also serialises queue reservations.
            let mut sessions = self.sessions();
            if self.waiting() >= limits.max_queue_depth {
                return Err(SandboxError::ResourceExhausted(format!(
                    "admission queue is full ({} waiting)",
                    limits.max_queue_depth
                )));
            }

            let count = sessions.entry(session.clone()).or_insert(0);
            if *count >= limits.max_per_session {
                return Err(SandboxError::SessionConcurrencyExceeded {
                    session,
                    limit: limits.max_per_session,
                });
            }
            *count += 1;
            self.inner.pending.fetch_add(1, Ordering::SeqCst);
        }

        let now = Instant::now();
        Ok(QueueTicket {
            request_id,
            enqueued_at: now,
            deadline: now + limits.queue_timeout,
            position: QueuePosition {
                governor: self.clone(),
            },
            session: SessionSlot {
                governor: self.clone(),
                session,
            },
        })
    }

    /// Stop admitting. Queued tickets fail and later `admit` calls are refused.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.slots.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> GovernorStats {
        let max = self.inner.limits.max_concurrent;
        GovernorStats {
            running: max.saturating_sub(self.inner.slots.available_permits()),
            queued: self.waiting(),
            max_concurrent: max,
        }
    }

    /// Queued plus running requests for `session`.
    pub fn session_load(&self, session: &SessionId) -> usize {
        self.sessions().get(session).copied().unwrap_or(0)
    }

    pub fn limits(&self) -> GovernorLimits {
        self.inner.limits
    }

    /// The registry of live sandboxes.
    pub fn registry(&self) -> &SandboxRegistry {
        &self.inner.registry
    }

    // Outstanding tickets that free slots cannot absorb.
    fn waiting(&self) -> usize {
        self.inner
            .pending
            .load(Ordering::SeqCst)
            .saturating_sub(self.inner.slots.available_permits())
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, usize>> {
        self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release_session(&self, session: &SessionId) {
        let mut sessions = self.sessions();
        if let Some(count) = sessions.get_mut(session) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                sessions.remove(session);
            }
        }
    }
}

/// Holds one unit of a session's allowance until dropped.
#[derive(Debug)]
struct SessionSlot {
    governor: ConcurrencyGovernor,
    session: SessionId,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.governor.release_session(&self.session);
    }
}

/// A reserved place in line, given back once the ticket holds a slot or is gone.
#[derive(Debug)]
struct QueuePosition {
    governor: ConcurrencyGovernor,
}

impl Drop for QueuePosition {
    fn drop(&mut self) {
        self.governor.inner.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A granted concurrency slot; dropping it returns the slot and the session
/// allowance.
#[derive(Debug)]
pub struct AdmissionPermit {
    request_id: RequestId,
    waited: Duration,
    _slot: OwnedSemaphorePermit,
    _session: SessionSlot,
}

impl AdmissionPermit {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Return the slot and session allowance.
    pub fn release(self) {
        drop(self);
    }
}

/// A request waiting for a concurrency slot.
#[derive(Debug)]
pub struct QueueTicket {
    request_id: RequestId,
    enqueued_at: Instant,
    deadline: Instant,
    position: QueuePosition,
    session: SessionSlot,
}

impl QueueTicket {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for a slot until the admission deadline.
    ///
    /// Fails with [`SandboxError::QueueTimeout`] if the deadline passes first;
    /// the session allowance is returned in that case.
    pub async fn wait(self) -> Result<AdmissionPermit> {
        let QueueTicket {
            request_id,
            enqueued_at,
            deadline,
            position,
            session,
        } = self;
        let slots = Arc::clone(&session.governor.inner.slots);

        let permit = match slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::debug!(%request_id, "waiting for a sandbox slot");
                match tokio::time::timeout_at(deadline, slots.acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => {
                        return Err(SandboxError::ResourceExhausted(
                            "admission closed".to_string(),
                        ))
                    }
                    Err(_) => {
                        tracing::info!(%request_id, "admission deadline passed");
                        return Err(SandboxError::QueueTimeout(
                            deadline.duration_since(enqueued_at),
                        ));
                    }
                }
            }
        };
        drop(position);

        Ok(AdmissionPermit {
            request_id,
            waited: enqueued_at.elapsed(),
            _slot: permit,
            _session: session,
        })
    }
}
