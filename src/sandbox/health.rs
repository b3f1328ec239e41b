//! Escalation of repeated substrate failures into a readiness signal.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

/// How long an unhealthy substrate is left alone before one request may retry it.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Readiness of the isolation substrate as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Some runtime failures occurred, but fewer than the threshold.
    Degraded,
    /// Consecutive runtime failures reached the threshold.
    Unhealthy,
}

/// Counts consecutive runtime failures and publishes the resulting status.
///
/// An unhealthy substrate is not written off: once per retry interval a single
/// request is let through, and its success restores [`HealthStatus::Healthy`].
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    threshold: u32,
    retry_interval: Duration,
    consecutive: AtomicU32,
    // Last failure or retry while unhealthy.
    last_attempt: Mutex<Option<Instant>>,
    status: watch::Sender<HealthStatus>,
}

impl HealthMonitor {
    /// `threshold` consecutive failures mark the substrate unhealthy.
    pub fn new(threshold: u32) -> Self {
        Self::with_retry_interval(threshold, DEFAULT_RETRY_INTERVAL)
    }

    pub fn with_retry_interval(threshold: u32, retry_interval: Duration) -> Self {
        let (status, _) = watch::channel(HealthStatus::Healthy);
        Self {
            inner: Arc::new(Inner {
                threshold: threshold.max(1),
                retry_interval,
                consecutive: AtomicU32::new(0),
                last_attempt: Mutex::new(None),
                status,
            }),
        }
    }

    /// A sandbox ran without substrate errors.
    pub fn record_success(&self) {
        self.inner.consecutive.store(0, Ordering::SeqCst);
        self.set(HealthStatus::Healthy);
    }

    /// The substrate failed while serving a request.
    pub fn record_failure(&self) {
        let count = self.inner.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.inner.threshold {
            *self.last_attempt() = Some(Instant::now());
            if self.set(HealthStatus::Unhealthy) {
                tracing::error!(
                    consecutive_failures = count,
                    "isolation substrate marked unhealthy"
                );
            }
        } else {
            self.set(HealthStatus::Degraded);
        }
    }

    pub fn status(&self) -> HealthStatus {
        *self.inner.status.borrow()
    }

    pub fn is_unhealthy(&self) -> bool {
        self.status() == HealthStatus::Unhealthy
    }

    /// Whether a request may reach the substrate now.
    ///
    /// Always true unless unhealthy. While unhealthy, true for one caller per
    /// retry interval; a failure of that retry restarts the wait.
    pub fn allow_request(&self) -> bool {
        if !self.is_unhealthy() {
            return true;
        }
        let mut last = self.last_attempt();
        let now = Instant::now();
        if last.is_some_and(|at| now.duration_since(at) < self.inner.retry_interval) {
            return false;
        }
        *last = Some(now);
        tracing::info!("letting one request retry the unhealthy substrate");
        true
    }

    /// Watch status transitions.
    pub fn watch(&self) -> watch::Receiver<HealthStatus> {
        self.inner.status.subscribe()
    }

    fn last_attempt(&self) -> MutexGuard<'_, Option<Instant>> {
        self.inner.last_attempt.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, status: HealthStatus) -> bool {
        self.inner.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalates_after_threshold() {
        let health = HealthMonitor::new(3);
        assert_eq!(health.status(), HealthStatus::Healthy);

        health.record_failure();
        health.record_failure();
        assert_eq!(health.status(), HealthStatus::Degraded);

        health.record_failure();
        assert!(health.is_unhealthy());
    }

    #[test]
    fn test_success_resets() {
        let health = HealthMonitor::new(2);
        health.record_failure();
        health.record_failure();
        assert!(health.is_unhealthy());

        health.record_success();
        assert_eq!(health.status(), HealthStatus::Healthy);

        health.record_failure();
        assert_eq!(health.status(), HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_unhealthy_lets_one_request_through_per_interval() {
        let health = HealthMonitor::with_retry_interval(1, Duration::from_millis(50));
        assert!(health.allow_request());

        health.record_failure();
        assert!(!health.allow_request());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(health.allow_request());
        // Only one retry until it resolves or the interval passes again.
        assert!(!health.allow_request());

        // A failed retry restarts the wait.
        health.record_failure();
        assert!(!health.allow_request());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(health.allow_request());
        health.record_success();
        assert_eq!(health.status(), HealthStatus::Healthy);
        assert!(health.allow_request());
    }

    #[tokio::test]
    async fn test_watchers_see_transitions() {
        let health = HealthMonitor::new(1);
        let mut rx = health.watch();

        health.record_failure();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), HealthStatus::Unhealthy);
    }
}
