//! MQTT v5 transport built on `rumqttc`
//!
//! - [`connection`] - pure option building and client ids
//! - [`message_handler`] - pure routing of event loop events
//! - [`client`] - the I/O: [`MqttConnector`] and [`MqttSession`]
//!
//! # Usage
//!
//! ```rust,no_run
//! use mb_subscriber::transport::mqtt::MqttConnector;
//! use mb_subscriber::transport::{connect_with_timeout, BrokerEndpoint, BrokerSession};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let connector = MqttConnector::new("my-service");
//! let endpoint: BrokerEndpoint = "localhost:1883".parse()?;
//!
//! let mut session =
//!     connect_with_timeout(&connector, &endpoint, None, Duration::from_secs(60)).await?;
//! session.subscribe("topology/#").await?;
//! session.close().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttConnector, MqttSession};
pub use connection::{configure_mqtt_options, generate_client_id};
pub use message_handler::{route_mqtt_event, EventRoute};
