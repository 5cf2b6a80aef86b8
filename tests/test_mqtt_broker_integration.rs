//! Integration Tests with a Real MQTT Broker
//!
//! Validates the MQTT transport and the full subscriber against a broker at
//! localhost:1883:
//! - Connection and subscription through `MqttConnector`
//! - Failover past an unreachable endpoint
//! - End-to-end delivery from a publisher to a registered handler
//!
//! All tests are ignored by default; run with `cargo test -- --ignored`.


use mb_subscriber::subscriber::{ConnectionState, InboundMessage};
use mb_subscriber::transport::{BrokerSession, Connector};
use mb_subscriber::{EventSubscriber, HandlerResult, MqttConnector};
use mqtt_integration_helpers::{
    local_broker, publish, unique_topic_root, unreachable_broker, MQTT_BROKER_URL,
    UNREACHABLE_BROKER_URL,
};
use std::time::Duration;
use tokio::sync::mpsc;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

async fn wait_connected<C: Connector>(subscriber: &EventSubscriber<C>) {
    let mut changes = subscriber.state_changes();
    tokio::time::timeout(
        Duration::from_secs(10),
        changes.wait_for(|state| *state == ConnectionState::Connected),
    )
    .await
    .expect("subscriber should connect to the local broker")
    .expect("state channel closed");
}

#[tokio::test]
#[ignore] // Requires an MQTT broker at localhost:1883
async fn test_connect_and_subscribe_to_real_broker() {
    let connector = MqttConnector::default();
    let mut session = connector
        .connect(&local_broker(), None, CONNECT_TIMEOUT)
        .await
        .expect("should connect to the local broker");

    assert_eq!(session.endpoint(), &local_broker());

    let topic = format!("{}/#", unique_topic_root("subscribe"));
    session
        .subscribe(&topic)
        .await
        .expect("subscription should be confirmed");

    session.close().await;
}

#[tokio::test]
#[ignore] // Requires an MQTT broker at localhost:1883
async fn test_connect_to_unreachable_endpoint_fails() {
    let connector = MqttConnector::default();
    let result = connector
        .connect(&unreachable_broker(), None, CONNECT_TIMEOUT)
        .await;
    assert!(result.is_err(), "nothing listens on {UNREACHABLE_BROKER_URL}");
}

#[tokio::test]
#[ignore] // Requires an MQTT broker at localhost:1883
async fn test_fails_over_from_unreachable_to_local_broker() {
    let topic = format!("{}/#", unique_topic_root("failover"));
    let subscriber =
        EventSubscriber::new(&topic, &[UNREACHABLE_BROKER_URL, MQTT_BROKER_URL], None).unwrap();

    let handle = subscriber.start().unwrap();
    wait_connected(&subscriber).await;

    let metrics = subscriber.metrics();
    assert_eq!(metrics.sessions_established, 1);
    assert!(metrics.connection_failures >= 1);

    handle.shutdown().await.unwrap();
    assert!(!subscriber.is_subscribed());
}

#[tokio::test]
#[ignore] // Requires an MQTT broker at localhost:1883
async fn test_published_event_reaches_handler() {
    let root = unique_topic_root("e2e");
    let subscriber = EventSubscriber::new(&format!("{root}/#"), &[MQTT_BROKER_URL], None).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    subscriber.register_handler("created", move |message: InboundMessage| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message);
            HandlerResult::Ok(())
        }
    });

    let handle = subscriber.start().unwrap();
    wait_connected(&subscriber).await;

    publish(&format!("{root}/service/deleted"), "ignored").await;
    publish(&format!("{root}/service/created"), r#"{"id":"svc-1"}"#).await;

    let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("handler should receive the event")
        .expect("handler channel closed");

    assert_eq!(message.topic, format!("{root}/service/created"));
    assert_eq!(message.payload_str(), r#"{"id":"svc-1"}"#);
    assert_eq!(subscriber.metrics().unmatched_events, 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires an MQTT broker at localhost:1883
async fn test_heartbeat_keeps_healthy_session() {
    let topic = format!("{}/#", unique_topic_root("heartbeat"));
    let mut config = mb_subscriber::SubscriberConfig::new(&topic, vec![MQTT_BROKER_URL.into()]);
    config.timing.heartbeat_interval_secs = 1;

    let subscriber = EventSubscriber::from_config(&config).unwrap();
    let handle = subscriber.start().unwrap();
    wait_connected(&subscriber).await;

    // Several probes pass without disturbing the session
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    let metrics = subscriber.metrics();
    assert_eq!(metrics.probe_failures, 0);
    assert_eq!(metrics.sessions_established, 1);
    assert!(subscriber.is_subscribed());

    handle.shutdown().await.unwrap();
}
