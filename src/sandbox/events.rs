//! Lifecycle event fan-out.
//!
//! Events for every request go through one [`EventDispatcher`]. Each
//! subscriber reads through its own cursor over a bounded ring: publishing
//! never waits on a subscriber, and a subscriber that falls more than the ring
//! capacity behind loses the oldest events and is told how many it missed.

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use serde::{Serialize, Serializer};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::error::{ErrorKind, SandboxError};
use crate::sandbox::types::{ExecutionOutcome, Language, OutputStream, RequestId, SessionId};

/// One step in a request's lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// The sandbox exists and the guest is about to start.
    Started { language: Language },
    /// Bytes read from one of the guest's output streams.
    OutputChunk {
        stream: OutputStream,
        #[serde(serialize_with = "lossy_utf8")]
        data: Bytes,
    },
    /// Terminal: the guest ran and produced an outcome.
    Completed(ExecutionOutcome),
    /// Terminal: the request could not be run.
    Failed { kind: ErrorKind, message: String },
}

impl ExecutionEvent {
    /// Whether this event ends the request's event sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::Completed(_) | ExecutionEvent::Failed { .. }
        )
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionEvent::Started { .. } => "started",
            ExecutionEvent::OutputChunk { .. } => "output_chunk",
            ExecutionEvent::Completed(_) => "completed",
            ExecutionEvent::Failed { .. } => "failed",
        }
    }
}

fn lossy_utf8<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(data))
}

/// An event together with the request it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    pub request_id: RequestId,
    pub session_id: SessionId,
    /// Position of this event within its request, starting at 0.
    pub sequence: u64,
    pub event: ExecutionEvent,
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(EventEnvelope),
    /// The subscriber fell behind and `missed` events were dropped.
    SubscriberLagged { missed: u64 },
}

/// Publish/subscribe bus for execution events.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventDispatcher {
    /// Create a dispatcher whose subscribers may each lag `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to every current subscriber. Never blocks.
    ///
    /// Returns the number of subscribers that will see it.
    pub fn publish(&self, envelope: EventEnvelope) -> usize {
        self.sender.send(envelope).unwrap_or(0)
    }

    /// Subscribe to all requests, or to one request when `request_id` is set.
    ///
    /// Only events published after this call are delivered.
    pub fn subscribe(&self, request_id: Option<RequestId>) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            filter: request_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A live subscription to the event bus.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<EventEnvelope>,
    filter: Option<RequestId>,
}

impl Subscription {
    /// Wait for the next delivery. Returns `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) if self.accepts(&envelope) => return Some(Delivery::Event(envelope)),
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    return Some(Delivery::SubscriberLagged { missed })
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Receive until the terminal event of the filtered request, returning all
    /// events in order. Lag notices are skipped.
    ///
    /// Returns early if the dispatcher is dropped.
    pub async fn collect_until_terminal(&mut self) -> Vec<EventEnvelope> {
        let mut events = Vec::new();
        while let Some(delivery) = self.recv().await {
            if let Delivery::Event(envelope) = delivery {
                let terminal = envelope.event.is_terminal();
                events.push(envelope);
                if terminal && self.filter.is_some() {
                    break;
                }
            }
        }
        events
    }

    /// Convert into a `Stream` of deliveries.
    pub fn into_stream(self) -> impl Stream<Item = Delivery> + Send {
        stream::unfold(self, |mut sub| async move {
            let next = sub.recv().await?;
            Some((next, sub))
        })
    }

    fn accepts(&self, envelope: &EventEnvelope) -> bool {
        self.filter.map_or(true, |id| envelope.request_id == id)
    }
}

/// Publishes one request's events in order and guarantees a single terminal event.
///
/// Terminal methods consume the emitter. If it is dropped without one (for
/// example while unwinding from a panic) a `Failed { kind: Internal }` event
/// is published instead.
#[derive(Debug)]
pub struct RequestEvents {
    dispatcher: EventDispatcher,
    request_id: RequestId,
    session_id: SessionId,
    sequence: u64,
    terminated: bool,
}

impl RequestEvents {
    pub fn new(dispatcher: EventDispatcher, request_id: RequestId, session_id: SessionId) -> Self {
        Self {
            dispatcher,
            request_id,
            session_id,
            sequence: 0,
            terminated: false,
        }
    }

    pub fn started(&mut self, language: Language) {
        self.emit(ExecutionEvent::Started { language });
    }

    pub fn output(&mut self, stream: OutputStream, data: Bytes) {
        self.emit(ExecutionEvent::OutputChunk { stream, data });
    }

    pub fn complete(mut self, outcome: ExecutionOutcome) {
        self.emit(ExecutionEvent::Completed(outcome));
        self.terminated = true;
    }

    pub fn fail(mut self, error: &SandboxError) {
        self.emit(ExecutionEvent::Failed {
            kind: error.kind(),
            message: error.to_string(),
        });
        self.terminated = true;
    }

    fn emit(&mut self, event: ExecutionEvent) {
        let envelope = EventEnvelope {
            request_id: self.request_id,
            session_id: self.session_id.clone(),
            sequence: self.sequence,
            event,
        };
        self.sequence += 1;
        self.dispatcher.publish(envelope);
    }
}

impl Drop for RequestEvents {
    fn drop(&mut self) {
        if !self.terminated {
            tracing::warn!(
                request_id = %self.request_id,
                "request ended without a terminal event"
            );
            self.emit(ExecutionEvent::Failed {
                kind: ErrorKind::Internal,
                message: "execution ended unexpectedly".to_string(),
            });
            self.terminated = true;
        }
    }
}
