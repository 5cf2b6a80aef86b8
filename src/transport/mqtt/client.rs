//! `rumqttc` implementation of [`Connector`] and [`BrokerSession`]
//!
//! A connection is only handed out after the broker's CONNACK arrived, and a
//! subscription only counts once its SUBACK arrived. Messages that slip in
//! between SUBSCRIBE and SUBACK are buffered and delivered first by
//! [`MqttSession::run_until_disconnected`].

use super::connection::{configure_mqtt_options, DEFAULT_CLIENT_ID_PREFIX};
use super::message_handler::{route_mqtt_event, EventRoute};
use crate::subscriber::dispatch::{InboundMessage, MessageSink};
use crate::transport::{
    BrokerEndpoint, BrokerError, BrokerSession, Connector, Credentials, DisconnectHandle,
};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use rumqttc::Outgoing;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace};

/// Request channel capacity between `AsyncClient` and its event loop
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// How long `close` keeps driving the event loop to flush DISCONNECT
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Opens MQTT v5 connections with `rumqttc`
#[derive(Debug, Clone)]
pub struct MqttConnector {
    client_id_prefix: String,
}

impl MqttConnector {
    pub fn new<S: Into<String>>(client_id_prefix: S) -> Self {
        Self {
            client_id_prefix: client_id_prefix.into(),
        }
    }

    /// Drive a fresh event loop until the broker answers the CONNECT
    async fn wait_for_connack(
        endpoint: &BrokerEndpoint,
        event_loop: &mut EventLoop,
    ) -> Result<(), BrokerError> {
        loop {
            let event = event_loop
                .poll()
                .await
                .map_err(|e| BrokerError::ConnectFailed {
                    endpoint: endpoint.to_string(),
                    source: e.to_string().into(),
                })?;

            match route_mqtt_event(&event) {
                EventRoute::ConnectionAcknowledged { accepted: true, .. } => return Ok(()),
                EventRoute::ConnectionAcknowledged { accepted: false, reason } => {
                    return Err(BrokerError::Refused {
                        endpoint: endpoint.to_string(),
                        reason,
                    });
                }
                route => trace!(?route, "Event before ConnAck"),
            }
        }
    }
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_ID_PREFIX)
    }
}

#[async_trait]
impl Connector for MqttConnector {
    type Session = MqttSession;

    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        credentials: Option<&Credentials>,
        timeout: Duration,
    ) -> Result<MqttSession, BrokerError> {
        let options = configure_mqtt_options(&self.client_id_prefix, endpoint, credentials);
        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        let acknowledged =
            tokio::time::timeout(timeout, Self::wait_for_connack(endpoint, &mut event_loop)).await;

        match acknowledged {
            Ok(Ok(())) => {
                debug!(endpoint = %endpoint, "ConnAck received");
                Ok(MqttSession::new(client, event_loop, endpoint.clone()))
            }
            Ok(Err(e)) => {
                let _ = client.try_disconnect();
                Err(e)
            }
            Err(_) => {
                let _ = client.try_disconnect();
                Err(BrokerError::timeout(endpoint, timeout))
            }
        }
    }
}

/// One acknowledged MQTT connection
pub struct MqttSession {
    client: AsyncClient,
    event_loop: EventLoop,
    endpoint: BrokerEndpoint,
    handle: DisconnectHandle,
    pending: VecDeque<InboundMessage>,
    closed: bool,
}

impl MqttSession {
    fn new(client: AsyncClient, event_loop: EventLoop, endpoint: BrokerEndpoint) -> Self {
        Self {
            client,
            event_loop,
            endpoint,
            handle: DisconnectHandle::new(),
            pending: VecDeque::new(),
            closed: false,
        }
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    fn connection_lost(e: rumqttc::v5::ConnectionError) -> BrokerError {
        BrokerError::ConnectionLost(e.to_string().into())
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| BrokerError::SubscribeFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        loop {
            let event = self
                .event_loop
                .poll()
                .await
                .map_err(Self::connection_lost)?;

            match route_mqtt_event(&event) {
                EventRoute::SubscriptionConfirmed { rejected } if rejected.is_empty() => {
                    return Ok(());
                }
                EventRoute::SubscriptionConfirmed { rejected } => {
                    return Err(BrokerError::SubscribeFailed {
                        topic: topic.to_string(),
                        reason: rejected.join(", "),
                    });
                }
                EventRoute::MessageReceived { topic, payload } => {
                    self.pending.push_back(InboundMessage::new(topic, payload));
                }
                EventRoute::Disconnected => return Err(BrokerError::DisconnectedByBroker),
                route => trace!(?route, "Event before SubAck"),
            }
        }
    }

    async fn run_until_disconnected(&mut self, sink: &MessageSink) -> Result<(), BrokerError> {
        while let Some(message) = self.pending.pop_front() {
            sink.push(message);
        }

        let handle = self.handle.clone();
        loop {
            tokio::select! {
                biased;
                _ = handle.disconnected() => {
                    debug!(endpoint = %self.endpoint, "Disconnect requested");
                    return Ok(());
                }
                event = self.event_loop.poll() => {
                    let event = event.map_err(Self::connection_lost)?;
                    match route_mqtt_event(&event) {
                        EventRoute::MessageReceived { topic, payload } => {
                            sink.push(InboundMessage::new(topic, payload));
                        }
                        EventRoute::Disconnected => return Err(BrokerError::DisconnectedByBroker),
                        route => trace!(?route, "MQTT event"),
                    }
                }
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

        if self.client.try_disconnect().is_err() {
            return;
        }

        let event_loop = &mut self.event_loop;
        let flushed = tokio::time::timeout(CLOSE_GRACE, async {
            loop {
                match event_loop.poll().await {
                    Ok(rumqttc::v5::Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;

        if flushed.is_err() {
            debug!(endpoint = %self.endpoint, "DISCONNECT not flushed before closing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_connector_prefix() {
        let connector = MqttConnector::default();
        assert_eq!(connector.client_id_prefix, DEFAULT_CLIENT_ID_PREFIX);
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails_fast() {
        // Port 1 on localhost is essentially never listening
        let connector = MqttConnector::new("test");
        let endpoint = BrokerEndpoint::new("127.0.0.1", 1);

        let result = connector
            .connect(&endpoint, None, Duration::from_secs(5))
            .await;

        match result {
            Err(BrokerError::ConnectFailed { endpoint: e, .. }) => assert_eq!(e, "127.0.0.1:1"),
            Err(BrokerError::Timeout { .. }) => {}
            Err(other) => panic!("Unexpected error: {other}"),
            Ok(_) => panic!("Nothing should accept MQTT on port 1"),
        }
    }
}
