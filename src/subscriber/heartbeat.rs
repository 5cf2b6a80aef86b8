//! Liveness probing of the connected broker
//!
//! A broker that goes silent without closing the TCP connection leaves the
//! session's network loop blocked. [`HeartbeatChecker`] opens a separate
//! short-lived connection to the same endpoint on every tick and closes it
//! again. If that fails the broker is considered gone and the ACTIVE session
//! is disconnected through its [`DisconnectHandle`], which returns control to
//! the supervisor.
//!
//! Failures are not retried inline; the next tick probes again.

use crate::observability::SubscriberMetrics;
use crate::transport::{
    connect_with_timeout, BrokerEndpoint, BrokerSession, Connector, Credentials, DisconnectHandle,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Periodic broker reachability check bound to one active session
pub struct HeartbeatChecker<C: Connector> {
    connector: Arc<C>,
    endpoint: BrokerEndpoint,
    credentials: Option<Credentials>,
    active: DisconnectHandle,
    connect_timeout: Duration,
    metrics: Arc<SubscriberMetrics>,
}

/// Result of a single probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Broker accepted the probe connection
    Reachable,
    /// Probe failed and the active session was told to disconnect
    Unreachable,
}

impl<C: Connector> HeartbeatChecker<C> {
    pub fn new(
        connector: Arc<C>,
        endpoint: BrokerEndpoint,
        credentials: Option<Credentials>,
        active: DisconnectHandle,
        connect_timeout: Duration,
        metrics: Arc<SubscriberMetrics>,
    ) -> Self {
        Self {
            connector,
            endpoint,
            credentials,
            active,
            connect_timeout,
            metrics,
        }
    }

    /// Connect and immediately disconnect; on failure disconnect the active session
    pub async fn probe(&self) -> ProbeOutcome {
        let result = connect_with_timeout(
            self.connector.as_ref(),
            &self.endpoint,
            self.credentials.as_ref(),
            self.connect_timeout,
        )
        .await;

        match result {
            Ok(mut session) => {
                session.close().await;
                debug!(endpoint = %self.endpoint, "Message broker heartbeat OK");
                ProbeOutcome::Reachable
            }
            Err(e) => {
                warn!(
                    endpoint = %self.endpoint,
                    error = %e,
                    "Message broker cannot be reached, disconnecting client"
                );
                self.metrics.record_probe_failure();
                self.active.disconnect();
                ProbeOutcome::Unreachable
            }
        }
    }

    /// Probe every `period` until `token` is cancelled.
    ///
    /// The first probe runs one full period after start. A probe that takes
    /// longer than the period delays the schedule instead of piling up ticks.
    pub async fn run(self, period: Duration, token: CancellationToken) {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = self.active.disconnected() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = self.probe() => {}
                    }
                }
            }
        }
        debug!(endpoint = %self.endpoint, "Heartbeat checker stopped");
    }

    /// Spawn [`HeartbeatChecker::run`] as a background task
    pub fn spawn(self, period: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(period, token))
    }
}
