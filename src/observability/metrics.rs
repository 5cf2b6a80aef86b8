//! Thread-safe subscriber metrics
//!
//! Atomic counters shared by the supervisor, probe and dispatch tasks.
//! Each [`EventSubscriber`](crate::subscriber::EventSubscriber) owns one
//! collector; [`SubscriberMetrics::snapshot`] gives a consistent-enough copy
//! for logging or a status endpoint.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for connection, probe and dispatch activity
#[derive(Debug, Default)]
pub struct SubscriberMetrics {
    // Connection lifecycle
    connection_attempts: AtomicU64,
    connection_failures: AtomicU64,
    sessions_established: AtomicU64,
    failed_passes: AtomicU64,
    probe_failures: AtomicU64,

    // Dispatch
    messages_received: AtomicU64,
    messages_dispatched: AtomicU64,
    unmatched_events: AtomicU64,
    handler_failures: AtomicU64,

    // Supervision
    task_restarts: AtomicU64,
}

/// Point-in-time copy of [`SubscriberMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connection_attempts: u64,
    pub connection_failures: u64,
    pub sessions_established: u64,
    pub failed_passes: u64,
    pub probe_failures: u64,
    pub messages_received: u64,
    pub messages_dispatched: u64,
    pub unmatched_events: u64,
    pub handler_failures: u64,
    pub task_restarts: u64,
}

impl SubscriberMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_established(&self) {
        self.sessions_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_pass(&self) {
        self.failed_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe_failure(&self) {
        self.probe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_dispatched(&self) {
        self.messages_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unmatched_event(&self) {
        self.unmatched_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_restart(&self) {
        self.task_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            sessions_established: self.sessions_established.load(Ordering::Relaxed),
            failed_passes: self.failed_passes.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            unmatched_events: self.unmatched_events.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            task_restarts: self.task_restarts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_new_metrics_are_zero() {
        let metrics = SubscriberMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_record_and_snapshot() {
        let metrics = SubscriberMetrics::new();
        metrics.record_connection_attempt();
        metrics.record_connection_attempt();
        metrics.record_connection_failure();
        metrics.record_session_established();
        metrics.record_message_received();
        metrics.record_unmatched_event();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connection_attempts, 2);
        assert_eq!(snapshot.connection_failures, 1);
        assert_eq!(snapshot.sessions_established, 1);
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.unmatched_events, 1);
        assert_eq!(snapshot.handler_failures, 0);
    }

    #[test]
    fn test_concurrent_updates() {
        let metrics = Arc::new(SubscriberMetrics::new());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_message_dispatched();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(metrics.snapshot().messages_dispatched, 4000);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = SubscriberMetrics::new();
        metrics.record_probe_failure();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["probe_failures"], 1);
    }
}
