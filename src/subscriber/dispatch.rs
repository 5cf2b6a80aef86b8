//! Decoupled event dispatch
//!
//! The network loop only ever calls [`MessageSink::push`], which enqueues and
//! returns. A single [`EventExecutor`] drains the queue in arrival order,
//! derives the event name from the last topic segment and invokes the handler
//! registered for it in the [`HandlerRegistry`].
//!
//! The queue is unbounded: a slow handler grows memory instead of stalling
//! message receipt. There is no durability; messages still queued when the
//! executor stops are dropped.

use crate::error::HandlerResult;
use crate::observability::SubscriberMetrics;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, warn, Instrument};

/// Separator between topic segments; the event name follows the last one
pub const TOPIC_SEPARATOR: char = '/';

/// A message received from the broker, enqueued verbatim
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    /// Final path segment of the topic
    pub fn event_name(&self) -> &str {
        event_name(&self.topic)
    }

    /// Payload as UTF-8, replacing invalid sequences
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Event name for a topic: the substring after the last separator, or the
/// whole topic when it has none
pub fn event_name(topic: &str) -> &str {
    topic
        .rsplit_once(TOPIC_SEPARATOR)
        .map_or(topic, |(_, event)| event)
}

/// Application callback for one event name
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, message: InboundMessage) -> HandlerResult {
        (self)(message).await
    }
}

/// Event name to handler mapping, shared between registration and dispatch.
///
/// At most one handler per event name; registering again replaces it.
/// Lookups clone the handler out so it always runs outside the lock.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn EventHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`; returns true if it replaced another
    pub fn register<S, H>(&self, event: S, handler: H) -> bool
    where
        S: Into<String>,
        H: EventHandler + 'static,
    {
        self.register_arc(event, Arc::new(handler))
    }

    pub fn register_arc<S: Into<String>>(&self, event: S, handler: Arc<dyn EventHandler>) -> bool {
        let event = event.into();
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let replaced = handlers.insert(event.clone(), handler).is_some();
        if replaced {
            debug!(event = %event, "Replaced handler for event");
        } else {
            debug!(event = %event, "Registered handler for event");
        }
        replaced
    }

    pub fn get(&self, event: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .cloned()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(event)
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("HandlerRegistry")
            .field("events", &handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Producer half of the dispatch queue, held by the network loop
#[derive(Debug, Clone)]
pub struct MessageSink {
    tx: mpsc::UnboundedSender<InboundMessage>,
    metrics: Arc<SubscriberMetrics>,
}

impl MessageSink {
    /// Enqueue without blocking. A closed queue drops the message with a warning.
    pub fn push(&self, message: InboundMessage) {
        debug!(topic = %message.topic, bytes = message.payload.len(), "Message received");
        self.metrics.record_message_received();
        if let Err(mpsc::error::SendError(message)) = self.tx.send(message) {
            warn!(topic = %message.topic, "Dispatch queue closed, dropping message");
        }
    }
}

/// Create the unbounded dispatch queue
pub fn event_queue(
    metrics: Arc<SubscriberMetrics>,
) -> (MessageSink, mpsc::UnboundedReceiver<InboundMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MessageSink { tx, metrics }, rx)
}

/// What happened to a single dequeued message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler ran and returned `Ok`
    Handled,
    /// No handler registered for the event; message dropped
    Unmatched,
    /// Handler returned an error or panicked
    Failed,
    /// Shutdown was requested while the handler ran; the handler was aborted
    Cancelled,
}

/// Single consumer of the dispatch queue
///
/// The receiver sits behind an async mutex so a restarted run loop picks up
/// the same queue after the previous one died.
pub struct EventExecutor {
    queue: Arc<Mutex<mpsc::UnboundedReceiver<InboundMessage>>>,
    registry: HandlerRegistry,
    metrics: Arc<SubscriberMetrics>,
}

impl EventExecutor {
    pub fn new(
        queue: mpsc::UnboundedReceiver<InboundMessage>,
        registry: HandlerRegistry,
        metrics: Arc<SubscriberMetrics>,
    ) -> Self {
        Self {
            queue: Arc::new(Mutex::new(queue)),
            registry,
            metrics,
        }
    }

    /// Drain the queue until `token` is cancelled or every producer is gone
    pub async fn run(&self, token: CancellationToken) {
        let mut queue = self.queue.lock().await;
        loop {
            let message = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Event executor stopping");
                    break;
                }
                message = queue.recv() => match message {
                    Some(message) => message,
                    None => {
                        debug!("Dispatch queue closed, event executor stopping");
                        break;
                    }
                },
            };
            if self.dispatch(message, &token).await == DispatchOutcome::Cancelled {
                debug!("Event executor stopping, in-flight handler aborted");
                break;
            }
        }
    }

    /// Dispatch one message to its handler, isolating handler failures.
    ///
    /// The handler runs in its own task so a panic is contained, but it is
    /// awaited before returning, which keeps dispatch strictly FIFO. The
    /// handler task is aborted if `token` is cancelled or this future is
    /// dropped before it finishes.
    pub async fn dispatch(
        &self,
        message: InboundMessage,
        token: &CancellationToken,
    ) -> DispatchOutcome {
        let event = message.event_name().to_string();

        let Some(handler) = self.registry.get(&event) else {
            debug!(
                event = %event,
                topic = %message.topic,
                "Event handler not found, discarding message"
            );
            self.metrics.record_unmatched_event();
            return DispatchOutcome::Unmatched;
        };

        debug!(event = %event, "Executing handler for event");
        let span = crate::dispatch_span!(event = %event, topic = %message.topic);
        let mut task = AbortOnDropHandle::new(tokio::spawn(
            async move { handler.handle(message).await }.instrument(span),
        ));

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => {
                // Dropping `task` on return aborts the handler
                warn!(event = %event, "Shutdown requested, aborting running handler");
                return DispatchOutcome::Cancelled;
            }
            outcome = &mut task => outcome,
        };

        match outcome {
            Ok(Ok(())) => {
                self.metrics.record_message_dispatched();
                DispatchOutcome::Handled
            }
            Ok(Err(e)) => {
                error!(event = %event, error = %e, "Error processing event");
                self.metrics.record_handler_failure();
                DispatchOutcome::Failed
            }
            Err(e) if e.is_panic() => {
                error!(event = %event, "Handler panicked while processing event");
                self.metrics.record_handler_failure();
                DispatchOutcome::Failed
            }
            Err(e) => {
                error!(event = %event, error = %e, "Handler task was cancelled");
                self.metrics.record_handler_failure();
                DispatchOutcome::Failed
            }
        }
    }
}
