//! Resilient event subscription
//!
//! [`EventSubscriber`] subscribes to one topic on whichever of several
//! redundant brokers is reachable and hands each received message to the
//! handler registered for its event name (the last topic segment).
//!
//! # Architecture
//!
//! - [`supervisor`] - broker selection, subscription and reconnect loop
//! - [`heartbeat`] - liveness probe that forces a silent broker's session closed
//! - [`retry`] - capped backoff between failed selection passes
//! - [`dispatch`] - queue, handler registry and the single dispatch consumer
//! - [`task`] - restart-on-panic wrapper for the long-running loops
//!
//! # Usage
//!
//! ```rust,no_run
//! use mb_subscriber::error::HandlerResult;
//! use mb_subscriber::subscriber::{EventSubscriber, InboundMessage};
//!
//! # tokio_test::block_on(async {
//! let subscriber = EventSubscriber::new(
//!     "topology/service/#",
//!     &["mb-1:1883", "mb-2:1883"],
//!     None,
//! )?;
//!
//! subscriber.register_handler("created", |message: InboundMessage| async move {
//!     println!("{}", message.payload_str());
//!     HandlerResult::Ok(())
//! });
//!
//! let handle = subscriber.start()?;
//! // ... run until the application exits
//! handle.shutdown().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod dispatch;
pub mod heartbeat;
pub mod retry;
pub mod supervisor;
pub mod task;

pub use dispatch::{
    event_name, DispatchOutcome, EventExecutor, EventHandler, HandlerRegistry, InboundMessage,
    MessageSink,
};
pub use heartbeat::{HeartbeatChecker, ProbeOutcome};
pub use retry::RetryIntervalSequence;
pub use supervisor::{ConnectionState, ConnectionSupervisor, SupervisorSettings};
pub use task::spawn_supervised;

use crate::config::SubscriberConfig;
use crate::error::{SubscriberError, SubscriberResult};
use crate::observability::{MetricsSnapshot, SubscriberMetrics};
use crate::transport::mqtt::MqttConnector;
use crate::transport::{Connector, Credentials};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long [`SubscriberHandle::shutdown`] waits for each background task
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Subscribes to one topic across redundant brokers and dispatches events
pub struct EventSubscriber<C: Connector = MqttConnector> {
    connector: Arc<C>,
    settings: SupervisorSettings,
    registry: HandlerRegistry,
    metrics: Arc<SubscriberMetrics>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    started: AtomicBool,
}

impl EventSubscriber<MqttConnector> {
    /// Subscriber for `topic` over the brokers in `urls`, tried in order.
    ///
    /// Each url is `host:port` or `mqtt://host[:port]`.
    pub fn new<S: AsRef<str>>(
        topic: &str,
        urls: &[S],
        credentials: Option<Credentials>,
    ) -> SubscriberResult<Self> {
        let config = SubscriberConfig::new(
            topic,
            urls.iter().map(|url| url.as_ref().to_string()).collect(),
        );
        config.validate()?;

        let settings = SupervisorSettings::from_config(&config)?.with_credentials(credentials);
        Ok(Self::with_connector(
            MqttConnector::new(config.subscriber.client_id_prefix.clone()),
            settings,
        ))
    }

    /// Subscriber from a loaded configuration, credentials resolved from the environment
    pub fn from_config(config: &SubscriberConfig) -> SubscriberResult<Self> {
        config.validate()?;

        let settings =
            SupervisorSettings::from_config(config)?.with_credentials(config.get_credentials());
        Ok(Self::with_connector(
            MqttConnector::new(config.subscriber.client_id_prefix.clone()),
            settings,
        ))
    }
}

impl<C: Connector> EventSubscriber<C> {
    /// Subscriber over an arbitrary transport
    pub fn with_connector(connector: C, settings: SupervisorSettings) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector: Arc::new(connector),
            settings,
            registry: HandlerRegistry::new(),
            metrics: Arc::new(SubscriberMetrics::new()),
            state_tx: Arc::new(state_tx),
            state_rx,
            started: AtomicBool::new(false),
        }
    }

    /// Register `handler` for `event`, replacing any previous one.
    ///
    /// Allowed before and after [`EventSubscriber::start`]; messages dequeued
    /// after this returns see the new handler.
    pub fn register_handler<S, H>(&self, event: S, handler: H)
    where
        S: Into<String>,
        H: EventHandler + 'static,
    {
        self.registry.register(event, handler);
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Launch the supervisor and dispatch loops; returns immediately.
    ///
    /// Only one start per subscriber is allowed.
    pub fn start(&self) -> SubscriberResult<SubscriberHandle> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SubscriberError::AlreadyStarted);
        }

        info!(
            topic = %self.settings.topic,
            brokers = ?self.settings.endpoints.iter().map(ToString::to_string).collect::<Vec<_>>(),
            handlers = self.registry.len(),
            "Starting event subscriber"
        );

        let token = CancellationToken::new();
        let (sink, queue) = dispatch::event_queue(self.metrics.clone());

        let executor = Arc::new(EventExecutor::new(
            queue,
            self.registry.clone(),
            self.metrics.clone(),
        ));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            self.connector.clone(),
            self.settings.clone(),
            sink,
            self.state_tx.clone(),
            self.metrics.clone(),
        ));

        let dispatch_task = {
            let token = token.clone();
            spawn_supervised("event-executor", token.clone(), self.metrics.clone(), move || {
                let executor = executor.clone();
                let token = token.clone();
                async move { executor.run(token).await }
            })
        };

        let supervisor_task = {
            let token = token.clone();
            spawn_supervised(
                "connection-supervisor",
                token.clone(),
                self.metrics.clone(),
                move || {
                    let supervisor = supervisor.clone();
                    let token = token.clone();
                    async move { supervisor.run(token).await }
                },
            )
        };

        Ok(SubscriberHandle {
            token,
            tasks: vec![
                ("connection-supervisor", supervisor_task),
                ("event-executor", dispatch_task),
            ],
        })
    }

    /// True only while a session is up and its subscription confirmed
    pub fn is_subscribed(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Receiver notified on every state transition
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Running subscriber; the background tasks keep running if this is dropped
pub struct SubscriberHandle {
    token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl SubscriberHandle {
    /// Token cancelled by [`SubscriberHandle::shutdown`]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop the supervisor and dispatch loops and wait for them.
    ///
    /// Messages still queued are dropped. A task that does not stop within
    /// [`SHUTDOWN_GRACE`] is aborted.
    pub async fn shutdown(self) -> SubscriberResult<()> {
        info!("Shutting down event subscriber");
        self.token.cancel();

        let mut failed = Vec::new();
        for (name, mut task) in self.tasks {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(task = name, error = %e, "Background task failed during shutdown");
                    failed.push(name);
                }
                Err(_) => {
                    warn!(task = name, "Background task did not stop in time, aborting");
                    task.abort();
                }
            }
        }

        if failed.is_empty() {
            info!("Event subscriber stopped");
            Ok(())
        } else {
            Err(SubscriberError::task_failed(failed.join(", ")))
        }
    }
}
