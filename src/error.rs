//! Error types for the event subscriber
//!
//! Configuration failures have their own enum next to the loader;
//! [`SubscriberError`] wraps it for the public facade. Transport failures
//! ([`crate::transport::BrokerError`]) never escape the supervisor loop:
//! connect, probe and handler failures are logged and recovered from, so
//! these types only surface from construction, configuration loading,
//! `start()` and `shutdown()`.

use crate::config::ConfigError;
use thiserror::Error;

/// Top-level error type for subscriber operations
#[derive(Debug, Error)]
pub enum SubscriberError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Subscriber already started")]
    AlreadyStarted,

    #[error("Background task failed: {message}")]
    TaskFailed { message: String },
}

impl SubscriberError {
    /// Create task failure error
    pub fn task_failed<S: Into<String>>(message: S) -> Self {
        Self::TaskFailed {
            message: message.into(),
        }
    }
}

/// Result type for subscriber operations
pub type SubscriberResult<T> = Result<T, SubscriberError>;

/// Error returned by application event handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for application event handlers
pub type HandlerResult = Result<(), HandlerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            SubscriberError::AlreadyStarted,
            SubscriberError::task_failed("dispatch loop panicked"),
            SubscriberError::Config(ConfigError::InvalidConfig("empty topic".to_string())),
            SubscriberError::Config(ConfigError::InvalidEndpoint("mb-1:x".to_string())),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_from_config_error() {
        let err: SubscriberError =
            ConfigError::InvalidEndpoint("mb-1:notaport".to_string()).into();
        assert!(matches!(err, SubscriberError::Config(ConfigError::InvalidEndpoint(_))));
        assert!(err.to_string().contains("mb-1:notaport"));
    }

    #[test]
    fn test_handler_error_boxing() {
        let result: HandlerResult = Err("handler blew up".into());
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "handler blew up");
    }
}
