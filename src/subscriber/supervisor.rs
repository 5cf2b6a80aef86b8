//! Broker selection and reconnect loop
//!
//! [`ConnectionSupervisor`] owns the active broker session and is the only
//! writer of [`ConnectionState`]. Its loop never gives up:
//!
//! ```text
//! Disconnected --(endpoint accepts)--> Connecting --(subscribed)--> Connected
//!      ^                                                                 |
//!      +------ network loop returned (probe, broker, network error) -----+
//! ```
//!
//! A selection pass tries every endpoint in configured order and stops at the
//! first that accepts. When a whole pass fails the supervisor sleeps for the
//! next [`RetryIntervalSequence`] value and tries again. While connected a
//! [`HeartbeatChecker`] watches the same endpoint and forces the session's
//! network loop to return if the broker stops answering.
//!
//! The only way out of the loop is the shutdown token.

use super::dispatch::MessageSink;
use super::heartbeat::HeartbeatChecker;
use super::retry::RetryIntervalSequence;
use crate::config::{ConfigError, SubscriberConfig};
use crate::observability::SubscriberMetrics;
use crate::transport::{
    connect_with_timeout, BrokerEndpoint, BrokerError, BrokerSession, Connector, Credentials,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Connection state of the subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No broker connection; selecting or backing off
    Disconnected,
    /// A broker accepted the connection; subscription not yet confirmed
    Connecting,
    /// Subscribed and receiving messages
    Connected,
}

/// Everything the supervisor needs to select brokers and maintain a session
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub endpoints: Vec<BrokerEndpoint>,
    pub topic: String,
    pub credentials: Option<Credentials>,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub retry: RetryIntervalSequence,
}

impl SupervisorSettings {
    /// Settings with the default timing: 60 s connect timeout, 5 s probe
    /// period and the default retry sequence
    pub fn new<S: Into<String>>(topic: S, endpoints: Vec<BrokerEndpoint>) -> Self {
        Self {
            endpoints,
            topic: topic.into(),
            credentials: None,
            connect_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(5),
            retry: RetryIntervalSequence::default(),
        }
    }

    /// Settings from a validated configuration; credentials are not resolved here
    pub fn from_config(config: &SubscriberConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            endpoints: config.endpoints()?,
            topic: config.subscriber.topic.clone(),
            credentials: None,
            connect_timeout: config.connect_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            retry: config.retry_sequence()?,
        })
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryIntervalSequence) -> Self {
        self.retry = retry;
        self
    }
}

/// Failover and reconnect control loop
pub struct ConnectionSupervisor<C: Connector> {
    connector: Arc<C>,
    settings: SupervisorSettings,
    sink: MessageSink,
    state: Arc<watch::Sender<ConnectionState>>,
    metrics: Arc<SubscriberMetrics>,
}

impl<C: Connector> ConnectionSupervisor<C> {
    pub fn new(
        connector: Arc<C>,
        settings: SupervisorSettings,
        sink: MessageSink,
        state: Arc<watch::Sender<ConnectionState>>,
        metrics: Arc<SubscriberMetrics>,
    ) -> Self {
        Self {
            connector,
            settings,
            sink,
            state,
            metrics,
        }
    }

    /// Keep the subscription backed by a live broker until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            topic = %self.settings.topic,
            brokers = self.settings.endpoints.len(),
            "Starting connection supervisor"
        );
        if self.settings.credentials.is_some() {
            info!("Message broker credentials are provided");
        }

        // Also runs while unwinding, so a panic never leaves `Connected` behind
        let _reset = StateReset(&self.state);

        let mut retry = self.fresh_retry();
        while let Some((endpoint, session)) = self.select_with(&mut retry, &shutdown).await {
            let span = crate::session_span!(endpoint = %endpoint);
            let established = self
                .run_session(endpoint, session, &shutdown)
                .instrument(span)
                .await;

            if established {
                retry.reset();
            } else if !self.backoff(&mut retry, &shutdown).await {
                break;
            }
        }

        info!("Connection supervisor stopped");
    }

    /// Pass over the endpoints in order until one accepts, starting from a
    /// fresh backoff sequence.
    ///
    /// Returns `None` only when shutdown was requested.
    pub async fn select_broker(
        &self,
        shutdown: &CancellationToken,
    ) -> Option<(BrokerEndpoint, C::Session)> {
        let mut retry = self.fresh_retry();
        self.select_with(&mut retry, shutdown).await
    }

    fn fresh_retry(&self) -> RetryIntervalSequence {
        let mut retry = self.settings.retry.clone();
        retry.reset();
        retry
    }

    /// Selection loop; `retry` advances once per failed pass
    async fn select_with(
        &self,
        retry: &mut RetryIntervalSequence,
        shutdown: &CancellationToken,
    ) -> Option<(BrokerEndpoint, C::Session)> {
        loop {
            for endpoint in &self.settings.endpoints {
                debug!(endpoint = %endpoint, "Trying to connect to the message broker");
                self.metrics.record_connection_attempt();

                let attempt = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return None,
                    attempt = connect_with_timeout(
                        self.connector.as_ref(),
                        endpoint,
                        self.settings.credentials.as_ref(),
                        self.settings.connect_timeout,
                    ) => attempt,
                };

                match attempt {
                    Ok(session) => {
                        self.set_state(ConnectionState::Connecting);
                        info!(endpoint = %endpoint, "Connected to the message broker");
                        return Some((endpoint.clone(), session));
                    }
                    Err(e) => {
                        self.metrics.record_connection_failure();
                        debug!(
                            endpoint = %endpoint,
                            error = %e,
                            "Could not connect to the message broker"
                        );
                    }
                }
            }

            self.metrics.record_failed_pass();
            warn!("Could not connect to any of the message brokers provided, retrying");
            if !self.backoff(retry, shutdown).await {
                return None;
            }
        }
    }

    /// Sleep for the next backoff interval; false if shutdown interrupted it
    async fn backoff(
        &self,
        retry: &mut RetryIntervalSequence,
        shutdown: &CancellationToken,
    ) -> bool {
        let wait = retry.next_interval();
        info!(retry_in_secs = wait.as_secs_f64(), "Waiting before the next connection pass");

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }

    /// Subscribe, probe and run the network loop of one session until it ends.
    ///
    /// Returns false if the subscription was never confirmed.
    async fn run_session(
        &self,
        endpoint: BrokerEndpoint,
        mut session: C::Session,
        shutdown: &CancellationToken,
    ) -> bool {
        if let Err(e) = self.subscribe(&mut session, shutdown).await {
            warn!(endpoint = %endpoint, error = %e, "Subscription failed, backing off");
            self.set_state(ConnectionState::Disconnected);
            session.close().await;
            return false;
        }
        if shutdown.is_cancelled() {
            session.close().await;
            return true;
        }

        self.set_state(ConnectionState::Connected);
        self.metrics.record_session_established();
        info!(endpoint = %endpoint, topic = %self.settings.topic, "Subscribed to topic");

        let active = session.disconnect_handle();
        let probe_token = shutdown.child_token();
        // Cancels the probe even if this future is dropped mid-session
        let _probe_guard = probe_token.clone().drop_guard();
        let probe = HeartbeatChecker::new(
            self.connector.clone(),
            endpoint.clone(),
            self.settings.credentials.clone(),
            active.clone(),
            self.settings.connect_timeout,
            self.metrics.clone(),
        )
        .spawn(self.settings.heartbeat_interval, probe_token.clone());

        let result = tokio::select! {
            result = session.run_until_disconnected(&self.sink) => result,
            _ = shutdown.cancelled() => {
                active.disconnect();
                Ok(())
            }
        };

        self.set_state(ConnectionState::Disconnected);
        probe_token.cancel();
        if let Err(e) = probe.await {
            warn!(endpoint = %endpoint, error = %e, "Heartbeat checker ended abnormally");
        }
        session.close().await;

        match result {
            Ok(()) => info!(endpoint = %endpoint, "Disconnected from the message broker"),
            Err(e) => warn!(endpoint = %endpoint, error = %e, "Connection to the message broker lost"),
        }
        true
    }

    /// Subscribe within the connect timeout, abandoning on shutdown
    async fn subscribe(
        &self,
        session: &mut C::Session,
        shutdown: &CancellationToken,
    ) -> Result<(), BrokerError> {
        let timeout = self.settings.connect_timeout;
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Ok(()),
            result = tokio::time::timeout(timeout, session.subscribe(&self.settings.topic)) => {
                match result {
                    Ok(subscribed) => subscribed,
                    Err(_) => Err(BrokerError::SubscribeFailed {
                        topic: self.settings.topic.clone(),
                        reason: format!("no confirmation within {}s", timeout.as_secs()),
                    }),
                }
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "Connection state changed");
        }
    }
}

/// Publishes `Disconnected` when the supervisor loop ends, by return or by panic
struct StateReset<'a>(&'a watch::Sender<ConnectionState>);

impl Drop for StateReset<'_> {
    fn drop(&mut self) {
        let previous = self.0.send_replace(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            debug!(from = ?previous, to = ?ConnectionState::Disconnected, "Connection state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::dispatch::event_queue;
    use crate::testing::MockConnector;

    fn endpoints(n: usize) -> Vec<BrokerEndpoint> {
        (0..n)
            .map(|i| BrokerEndpoint::new(format!("mb-{i}"), 1883))
            .collect()
    }

    fn supervisor(
        connector: Arc<MockConnector>,
        settings: SupervisorSettings,
    ) -> (ConnectionSupervisor<MockConnector>, watch::Receiver<ConnectionState>) {
        let metrics = Arc::new(SubscriberMetrics::new());
        let (sink, _queue) = event_queue(metrics.clone());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        (
            ConnectionSupervisor::new(connector, settings, sink, Arc::new(state_tx), metrics),
            state_rx,
        )
    }

    #[test]
    fn test_settings_defaults() {
        let settings = SupervisorSettings::new("t/#", endpoints(1));
        assert_eq!(settings.connect_timeout, Duration::from_secs(60));
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(settings.retry.max_interval(), Duration::from_secs(60));
        assert!(settings.credentials.is_none());
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = SubscriberConfig::new(
            "topology/#",
            vec!["a:1883".to_string(), "b:1884".to_string()],
        );
        config.timing.retry_intervals_secs = vec![1, 2];
        let settings = SupervisorSettings::from_config(&config).unwrap();
        assert_eq!(settings.endpoints, vec![
            BrokerEndpoint::new("a", 1883),
            BrokerEndpoint::new("b", 1884)
        ]);
        assert_eq!(settings.retry.max_interval(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_broker_skips_unreachable_in_order() {
        let eps = endpoints(3);
        let connector = Arc::new(MockConnector::new());
        connector.set_reachable(&eps[2], true);

        let settings = SupervisorSettings::new("t/#", eps.clone());
        let (supervisor, state) = supervisor(connector.clone(), settings);
        let started = tokio::time::Instant::now();
        let (endpoint, _session) = supervisor
            .select_broker(&CancellationToken::new())
            .await
            .expect("third endpoint is reachable");

        assert_eq!(endpoint, eps[2]);
        assert_eq!(connector.connect_attempts(), eps);
        assert_eq!(*state.borrow(), ConnectionState::Connecting);
        assert!(started.elapsed() < Duration::from_secs(1), "no backoff within a pass");
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_broker_backs_off_between_passes() {
        let eps = endpoints(2);
        let connector = Arc::new(MockConnector::new());
        let settings = SupervisorSettings::new("t/#", eps.clone())
            .with_retry(RetryIntervalSequence::from_secs(&[2, 5]).unwrap());
        let (supervisor, _state) = supervisor(connector.clone(), settings);

        let selecting = tokio::spawn(async move {
            supervisor.select_broker(&CancellationToken::new()).await.map(|(e, _)| e)
        });

        // Pass 1 fails, sleep 2s; pass 2 fails, sleep 5s; pass 3 fails, sleep 5s
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(connector.connect_attempts().len(), 2);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(connector.connect_attempts().len(), 4);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(connector.connect_attempts().len(), 6);

        connector.set_reachable(&eps[1], true);
        tokio::time::sleep(Duration::from_secs(5)).await;
        let endpoint = selecting.await.unwrap();
        assert_eq!(endpoint, Some(eps[1].clone()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_broker_returns_none_on_shutdown() {
        let connector = Arc::new(MockConnector::new());
        let settings = SupervisorSettings::new("t/#", endpoints(2));
        let (supervisor, _state) = supervisor(connector, settings);
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let selecting =
            tokio::spawn(async move { supervisor.select_broker(&token).await.is_none() });

        tokio::time::sleep(Duration::from_secs(30)).await;
        shutdown.cancel();
        assert!(selecting.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_endpoint_is_bounded_by_connect_timeout() {
        let eps = endpoints(2);
        let connector = Arc::new(MockConnector::new());
        connector.set_hanging(&eps[0], true);
        connector.set_reachable(&eps[1], true);

        let settings = SupervisorSettings::new("t/#", eps.clone())
            .with_connect_timeout(Duration::from_secs(10));
        let (supervisor, _state) = supervisor(connector, settings);

        let started = tokio::time::Instant::now();
        let (endpoint, _session) = supervisor
            .select_broker(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(endpoint, eps[1]);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_session_leaves_state_disconnected() {
        let eps = endpoints(1);
        let connector = Arc::new(MockConnector::new());
        connector.set_reachable(&eps[0], true);
        let settings = SupervisorSettings::new("t/#", eps);
        let (supervisor, mut state) = supervisor(connector.clone(), settings);

        let running = tokio::spawn(async move { supervisor.run(CancellationToken::new()).await });
        state.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();

        assert!(connector.crash_active_session());
        assert!(running.await.unwrap_err().is_panic());
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    }
}
