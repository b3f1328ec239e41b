//! Audit trail of execution events written through `tracing`.

use tokio::task::JoinHandle;

use crate::sandbox::events::{Delivery, EventDispatcher, ExecutionEvent};

/// Subscribe to every request and log one record per event.
///
/// The task ends when the dispatcher is dropped.
pub fn spawn_audit_logger(dispatcher: &EventDispatcher) -> JoinHandle<()> {
    let mut subscription = dispatcher.subscribe(None);
    tokio::spawn(async move {
        while let Some(delivery) = subscription.recv().await {
            let envelope = match delivery {
                Delivery::Event(envelope) => envelope,
                Delivery::SubscriberLagged { missed } => {
                    tracing::warn!(target: "sandbox::audit", missed, "audit logger lagged");
                    continue;
                }
            };

            let request_id = envelope.request_id;
            let session = envelope.session_id.as_str();
            match &envelope.event {
                ExecutionEvent::Started { language } => {
                    tracing::info!(target: "sandbox::audit", %request_id, session, %language, "started");
                }
                ExecutionEvent::OutputChunk { stream, data } => {
                    tracing::debug!(
                        target: "sandbox::audit",
                        %request_id,
                        session,
                        stream = ?stream,
                        bytes = data.len(),
                        "output"
                    );
                }
                ExecutionEvent::Completed(outcome) => {
                    tracing::info!(
                        target: "sandbox::audit",
                        %request_id,
                        session,
                        exit_code = outcome.exit_code,
                        timed_out = outcome.timed_out,
                        truncated = outcome.truncated,
                        duration_ms = outcome.duration_ms,
                        stdout_bytes = outcome.stdout.len(),
                        stderr_bytes = outcome.stderr.len(),
                        "completed"
                    );
                }
                ExecutionEvent::Failed { kind, message } => {
                    tracing::warn!(
                        target: "sandbox::audit",
                        %request_id,
                        session,
                        kind = ?kind,
                        message = %message,
                        "failed"
                    );
                }
            }
        }
    })
}
