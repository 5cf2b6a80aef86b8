//! Pure routing of `rumqttc` events
//!
//! Classifies each event coming out of the event loop so the I/O code in
//! [`super::client`] only has to act on the decision.

use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet};
use rumqttc::v5::Event;

/// What an MQTT event means to a session
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Broker answered the CONNECT; `accepted` is false for any refusal
    ConnectionAcknowledged { accepted: bool, reason: String },
    /// Message received on the subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// SUBSCRIBE confirmed; `rejected` lists any failure reason codes
    SubscriptionConfirmed { rejected: Vec<String> },
    /// Broker sent DISCONNECT
    Disconnected,
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Route one MQTT v5 event
pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(incoming) => match incoming {
            Packet::ConnAck(ack) => EventRoute::ConnectionAcknowledged {
                accepted: matches!(ack.code, ConnectReturnCode::Success),
                reason: format!("{:?}", ack.code),
            },
            Packet::Publish(publish) => EventRoute::MessageReceived {
                topic: String::from_utf8_lossy(&publish.topic).to_string(),
                payload: publish.payload.clone(),
            },
            Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                // Success codes carry the granted QoS; everything else is a refusal
                rejected: suback
                    .return_codes
                    .iter()
                    .map(|code| format!("{code:?}"))
                    .filter(|code| !code.starts_with("Success"))
                    .collect(),
            },
            Packet::Disconnect(_) => EventRoute::Disconnected,
            other => EventRoute::InfrastructureEvent(format!("{other:?}")),
        },
        Event::Outgoing(_) => EventRoute::OutgoingEvent,
    }
}
