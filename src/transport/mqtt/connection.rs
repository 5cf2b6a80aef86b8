//! Pure MQTT connection configuration
//!
//! Builds the `rumqttc` options for one connection attempt. Every attempt,
//! including each liveness probe, gets a fresh random client id so a probe
//! never takes over the subscription's session on the broker.

use crate::transport::{BrokerEndpoint, Credentials};
use rumqttc::v5::MqttOptions;
use std::time::Duration;
use uuid::Uuid;

/// Keep-alive interval negotiated with the broker
pub const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Largest packet accepted from the broker
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Client id prefix used when none is configured
pub const DEFAULT_CLIENT_ID_PREFIX: &str = "mb-subscriber";

/// Random client id of the form `{prefix}-{uuid}`
pub fn generate_client_id(prefix: &str) -> String {
    let prefix = if prefix.is_empty() {
        DEFAULT_CLIENT_ID_PREFIX
    } else {
        prefix
    };
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

/// Options for a single connection to `endpoint`
pub fn configure_mqtt_options(
    client_id_prefix: &str,
    endpoint: &BrokerEndpoint,
    credentials: Option<&Credentials>,
) -> MqttOptions {
    let mut options = MqttOptions::new(
        generate_client_id(client_id_prefix),
        endpoint.host.clone(),
        endpoint.port,
    );

    if let Some(credentials) = credentials {
        options.set_credentials(&credentials.username, &credentials.password);
    }

    options.set_keep_alive(KEEP_ALIVE);
    // MQTT v5 expects Option<u32> for max packet size
    options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ids_are_unique_and_prefixed() {
        let first = generate_client_id("topology");
        let second = generate_client_id("topology");

        assert!(first.starts_with("topology-"));
        assert_ne!(first, second);
        assert_eq!(first.len(), "topology-".len() + 32);
    }

    #[test]
    fn test_empty_prefix_falls_back_to_default() {
        assert!(generate_client_id("").starts_with("mb-subscriber-"));
    }

    #[test]
    fn test_configure_mqtt_options() {
        let endpoint = BrokerEndpoint::new("broker.local", 1884);
        let credentials = Credentials::new("user", "secret");
        let options = configure_mqtt_options("svc", &endpoint, Some(&credentials));

        assert_eq!(
            options.broker_address(),
            ("broker.local".to_string(), 1884)
        );
        assert_eq!(options.keep_alive(), KEEP_ALIVE);
        assert!(options.client_id().starts_with("svc-"));
    }
}
