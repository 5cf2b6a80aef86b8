//! Transport layer between the supervisor and a message broker
//!
//! The supervisor never talks to a broker library directly. It drives a
//! [`Connector`], which yields one [`BrokerSession`] per live connection. This
//! keeps the failover and probing logic independent of the wire protocol and
//! lets tests substitute an in-memory broker.

use crate::subscriber::dispatch::MessageSink;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod endpoint;
pub mod mqtt;

pub use endpoint::{BrokerEndpoint, Credentials, DEFAULT_MQTT_PORT};

/// Broker transport errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection to {endpoint} failed")]
    ConnectFailed {
        endpoint: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Connection to {endpoint} refused: {reason}")]
    Refused { endpoint: String, reason: String },
    #[error("Connection to {endpoint} timed out after {timeout_secs}s")]
    Timeout { endpoint: String, timeout_secs: u64 },
    #[error("Subscription to {topic} failed: {reason}")]
    SubscribeFailed { topic: String, reason: String },
    #[error("Broker closed the connection")]
    DisconnectedByBroker,
    #[error("Connection lost")]
    ConnectionLost(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl BrokerError {
    /// Build a timeout error for the given endpoint
    pub fn timeout(endpoint: &BrokerEndpoint, timeout: Duration) -> Self {
        Self::Timeout {
            endpoint: endpoint.to_string(),
            timeout_secs: timeout.as_secs(),
        }
    }
}

/// Thread-safe request to tear down a live session.
///
/// Cloned out of a session before it starts its network loop, so another
/// task (the liveness probe, or shutdown) can force the loop to return.
/// Disconnecting more than once is a no-op.
#[derive(Debug, Clone, Default)]
pub struct DisconnectHandle {
    token: CancellationToken,
}

impl DisconnectHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request disconnection; idempotent and never blocks
    pub fn disconnect(&self) {
        self.token.cancel();
    }

    pub fn is_disconnected(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`DisconnectHandle::disconnect`] has been called
    pub async fn disconnected(&self) {
        self.token.cancelled().await;
    }
}

/// Opens broker connections
///
/// Used both for the long-lived subscription session and for the probe's
/// short-lived check connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: BrokerSession;

    /// Connect to `endpoint` and wait for the broker's acknowledgement.
    ///
    /// Returns only once the broker accepted the connection. A refused
    /// acknowledgement disconnects and is reported as [`BrokerError::Refused`].
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        credentials: Option<&Credentials>,
        timeout: Duration,
    ) -> Result<Self::Session, BrokerError>;
}

/// Connect through `connector`, giving up once `timeout` has elapsed even if
/// the connector itself does not honour it
pub async fn connect_with_timeout<C: Connector>(
    connector: &C,
    endpoint: &BrokerEndpoint,
    credentials: Option<&Credentials>,
    timeout: Duration,
) -> Result<C::Session, BrokerError> {
    match tokio::time::timeout(timeout, connector.connect(endpoint, credentials, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(BrokerError::timeout(endpoint, timeout)),
    }
}

/// One established broker connection
#[async_trait]
pub trait BrokerSession: Send + 'static {
    /// Subscribe to `topic`, returning once the broker confirmed it
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    /// Run the network loop, pushing every inbound message into `sink`.
    ///
    /// Returns `Ok(())` when disconnected through the [`DisconnectHandle`] and
    /// an error when the broker or the network ended the session.
    async fn run_until_disconnected(&mut self, sink: &MessageSink) -> Result<(), BrokerError>;

    /// Handle that makes [`BrokerSession::run_until_disconnected`] return
    fn disconnect_handle(&self) -> DisconnectHandle;

    /// Close the connection; safe to call on an already closed session
    async fn close(&mut self);
}
