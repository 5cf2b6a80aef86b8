//! Structured logging and subscriber metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{MetricsSnapshot, SubscriberMetrics};

// Span macros for structured logging
pub use logging::{dispatch_span, session_span};
