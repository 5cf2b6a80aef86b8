//! Broker addressing and credentials
//!
//! Endpoints are parsed once from configuration and never change. Their order
//! in the configured list is the failover priority order.

use crate::config::ConfigError;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Default MQTT port used when a URL-form endpoint omits one
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// One candidate broker address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
}

impl BrokerEndpoint {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `mqtt://host[:port]` or `tcp://host[:port]`
    fn parse_url(s: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(s).map_err(|_| ConfigError::InvalidEndpoint(s.to_string()))?;
        if !matches!(url.scheme(), "mqtt" | "tcp") {
            return Err(ConfigError::InvalidEndpoint(format!(
                "{s}: unsupported scheme '{}'",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::InvalidEndpoint(s.to_string()))?;
        let port = url.port().unwrap_or(DEFAULT_MQTT_PORT);
        Ok(Self::new(host, port))
    }

    /// Parse bare `host:port`; the port is mandatory in this form
    fn parse_host_port(s: &str) -> Result<Self, ConfigError> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidEndpoint(format!("{s}: expected host:port")))?;
        let host = host.trim();
        if host.is_empty() {
            return Err(ConfigError::InvalidEndpoint(format!("{s}: empty host")));
        }
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidEndpoint(format!("{s}: invalid port")))?;
        if port == 0 {
            return Err(ConfigError::InvalidEndpoint(format!("{s}: port must be non-zero")));
        }
        Ok(Self::new(host, port))
    }
}

impl FromStr for BrokerEndpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains("://") {
            Self::parse_url(s)
        } else {
            Self::parse_host_port(s)
        }
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Broker username/password pair, applied to every connection when configured
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let endpoint: BrokerEndpoint = "10.0.0.5:1883".parse().unwrap();
        assert_eq!(endpoint, BrokerEndpoint::new("10.0.0.5", 1883));
        assert_eq!(endpoint.to_string(), "10.0.0.5:1883");

        let endpoint: BrokerEndpoint = " broker.local:61616 ".parse().unwrap();
        assert_eq!(endpoint.host, "broker.local");
        assert_eq!(endpoint.port, 61616);
    }

    #[test]
    fn test_parse_url_form() {
        let endpoint: BrokerEndpoint = "mqtt://broker.local:1884".parse().unwrap();
        assert_eq!(endpoint, BrokerEndpoint::new("broker.local", 1884));

        let endpoint: BrokerEndpoint = "tcp://broker.local".parse().unwrap();
        assert_eq!(endpoint.port, DEFAULT_MQTT_PORT);
    }

    #[test]
    fn test_parse_rejects_invalid() {
        for input in [
            "",
            "localhost",
            ":1883",
            "localhost:",
            "localhost:abc",
            "localhost:70000",
            "localhost:0",
            "http://localhost:1883",
            "mqtt://",
        ] {
            assert!(
                input.parse::<BrokerEndpoint>().is_err(),
                "expected '{input}' to be rejected"
            );
        }
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let credentials = Credentials::new("agent", "hunter2");
        let debug = format!("{credentials:?}");
        assert!(debug.contains("agent"));
        assert!(!debug.contains("hunter2"));
    }
}
