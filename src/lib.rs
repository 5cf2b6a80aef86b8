//! mb-subscriber
//!
//! A resilient event subscriber: keeps one topic subscription backed by a live
//! connection to one of several redundant MQTT brokers and dispatches inbound
//! messages to per-event handlers without blocking the network loop.
//!
//! # Overview
//!
//! - Broker failover in configured priority order, with capped backoff between
//!   fully failed passes
//! - Liveness probing of the connected broker through separate short-lived
//!   connections
//! - FIFO dispatch on a dedicated consumer, keyed by the last topic segment
//! - Delivery is at-least-once and best-effort; nothing is persisted
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mb_subscriber::{EventSubscriber, HandlerResult, InboundMessage};
//!
//! # tokio_test::block_on(async {
//! let subscriber = EventSubscriber::new("instance/status/#", &["mb-1:1883", "mb-2:1883"], None)?;
//! subscriber.register_handler("InstanceStartedEvent", |message: InboundMessage| async move {
//!     println!("instance started: {}", message.payload_str());
//!     HandlerResult::Ok(())
//! });
//!
//! let handle = subscriber.start()?;
//! handle.shutdown().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod subscriber;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, SubscriberConfig};
pub use error::{HandlerError, HandlerResult, SubscriberError, SubscriberResult};
pub use subscriber::{
    ConnectionState, EventHandler, EventSubscriber, InboundMessage, RetryIntervalSequence,
    SubscriberHandle,
};
pub use transport::mqtt::MqttConnector;
pub use transport::{BrokerEndpoint, BrokerError, Credentials};
