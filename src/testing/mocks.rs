//! In-memory broker for tests
//!
//! [`MockConnector`] stands in for a set of brokers. Each endpoint is either
//! reachable, unreachable (connect fails at once) or hanging (connect never
//! completes). Sessions that subscribe become the "active" session, which
//! tests feed with [`MockConnector::publish`] or kill with
//! [`MockConnector::drop_active_connection`].

use crate::subscriber::dispatch::{InboundMessage, MessageSink};
use crate::transport::{
    BrokerEndpoint, BrokerError, BrokerSession, Connector, Credentials, DisconnectHandle,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

enum SessionEvent {
    Message(InboundMessage),
    Dropped,
    Crash,
}

struct ActiveSession {
    id: u64,
    endpoint: BrokerEndpoint,
    inbox: mpsc::UnboundedSender<SessionEvent>,
}

#[derive(Default)]
struct BrokerState {
    reachable: HashSet<BrokerEndpoint>,
    hanging: HashSet<BrokerEndpoint>,
    fail_next: usize,
    reject_subscriptions: bool,
    attempts: Vec<BrokerEndpoint>,
    credentials_seen: Vec<Option<Credentials>>,
    subscriptions: Vec<(BrokerEndpoint, String)>,
    closed: usize,
    next_id: u64,
    active: Option<ActiveSession>,
}

/// Scriptable set of in-memory brokers
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<BrokerState>>,
}

impl MockConnector {
    /// All endpoints start unreachable
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_reachable(&self, endpoint: &BrokerEndpoint, reachable: bool) {
        let mut state = self.state();
        if reachable {
            state.reachable.insert(endpoint.clone());
        } else {
            state.reachable.remove(endpoint);
        }
    }

    /// A hanging endpoint accepts TCP but never acknowledges the connection
    pub fn set_hanging(&self, endpoint: &BrokerEndpoint, hanging: bool) {
        let mut state = self.state();
        if hanging {
            state.hanging.insert(endpoint.clone());
        } else {
            state.hanging.remove(endpoint);
        }
    }

    /// Fail the next `n` connects regardless of reachability
    pub fn fail_next_connects(&self, n: usize) {
        self.state().fail_next = n;
    }

    pub fn reject_subscriptions(&self, reject: bool) {
        self.state().reject_subscriptions = reject;
    }

    /// Every endpoint a connect was attempted on, in order
    pub fn connect_attempts(&self) -> Vec<BrokerEndpoint> {
        self.state().attempts.clone()
    }

    pub fn connect_attempts_to(&self, endpoint: &BrokerEndpoint) -> usize {
        self.state().attempts.iter().filter(|e| *e == endpoint).count()
    }

    /// Credentials passed to each connect, in order
    pub fn credentials_seen(&self) -> Vec<Option<Credentials>> {
        self.state().credentials_seen.clone()
    }

    pub fn subscriptions(&self) -> Vec<(BrokerEndpoint, String)> {
        self.state().subscriptions.clone()
    }

    /// Number of sessions closed so far, probe sessions included
    pub fn closed_sessions(&self) -> usize {
        self.state().closed
    }

    /// Endpoint of the subscribed session, if any
    pub fn active_endpoint(&self) -> Option<BrokerEndpoint> {
        self.state().active.as_ref().map(|a| a.endpoint.clone())
    }

    /// Deliver a message to the subscribed session; false when there is none
    pub fn publish<T: Into<String>, P: Into<Bytes>>(&self, topic: T, payload: P) -> bool {
        let state = self.state();
        match &state.active {
            Some(active) => active
                .inbox
                .send(SessionEvent::Message(InboundMessage::new(topic, payload)))
                .is_ok(),
            None => false,
        }
    }

    /// Make the broker end the subscribed session, as a protocol-level disconnect
    pub fn drop_active_connection(&self) -> bool {
        let mut state = self.state();
        match state.active.take() {
            Some(active) => active.inbox.send(SessionEvent::Dropped).is_ok(),
            None => false,
        }
    }

    /// Make the subscribed session's network loop panic
    pub fn crash_active_session(&self) -> bool {
        let state = self.state();
        match &state.active {
            Some(active) => active.inbox.send(SessionEvent::Crash).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Session = MockSession;

    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        credentials: Option<&Credentials>,
        _timeout: Duration,
    ) -> Result<MockSession, BrokerError> {
        let (hanging, outcome) = {
            let mut state = self.state();
            state.attempts.push(endpoint.clone());
            state.credentials_seen.push(credentials.cloned());

            if state.fail_next > 0 {
                state.fail_next -= 1;
                (false, Err("injected failure"))
            } else if state.hanging.contains(endpoint) {
                (true, Err("no acknowledgement"))
            } else if state.reachable.contains(endpoint) {
                state.next_id += 1;
                (false, Ok(state.next_id))
            } else {
                (false, Err("connection refused"))
            }
        };

        if hanging {
            std::future::pending::<()>().await;
        }

        match outcome {
            Ok(id) => Ok(MockSession::new(id, endpoint.clone(), self.state.clone())),
            Err(reason) => Err(BrokerError::ConnectFailed {
                endpoint: endpoint.to_string(),
                source: reason.into(),
            }),
        }
    }
}

/// Session handed out by [`MockConnector`]
pub struct MockSession {
    id: u64,
    endpoint: BrokerEndpoint,
    state: Arc<Mutex<BrokerState>>,
    handle: DisconnectHandle,
    inbox_tx: mpsc::UnboundedSender<SessionEvent>,
    inbox_rx: mpsc::UnboundedReceiver<SessionEvent>,
    closed: bool,
}

impl MockSession {
    fn new(id: u64, endpoint: BrokerEndpoint, state: Arc<Mutex<BrokerState>>) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            id,
            endpoint,
            state,
            handle: DisconnectHandle::new(),
            inbox_tx,
            inbox_rx,
            closed: false,
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl BrokerSession for MockSession {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        let mut state = self.state();
        if state.reject_subscriptions {
            return Err(BrokerError::SubscribeFailed {
                topic: topic.to_string(),
                reason: "NotAuthorized".to_string(),
            });
        }
        state
            .subscriptions
            .push((self.endpoint.clone(), topic.to_string()));
        state.active = Some(ActiveSession {
            id: self.id,
            endpoint: self.endpoint.clone(),
            inbox: self.inbox_tx.clone(),
        });
        Ok(())
    }

    async fn run_until_disconnected(&mut self, sink: &MessageSink) -> Result<(), BrokerError> {
        let handle = self.handle.clone();
        loop {
            tokio::select! {
                biased;
                _ = handle.disconnected() => return Ok(()),
                event = self.inbox_rx.recv() => match event {
                    Some(SessionEvent::Message(message)) => sink.push(message),
                    Some(SessionEvent::Dropped) => return Err(BrokerError::DisconnectedByBroker),
                    Some(SessionEvent::Crash) => panic!("network loop crashed"),
                    None => return Err(BrokerError::ConnectionLost("inbox closed".into())),
                },
            }
        }
    }

    fn disconnect_handle(&self) -> DisconnectHandle {
        self.handle.clone()
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.handle.disconnect();

        let mut state = self.state();
        state.closed += 1;
        if state.active.as_ref().is_some_and(|a| a.id == self.id) {
            state.active = None;
        }
    }
}
