//! Per-service counters
//!
//! One [`ServiceMetrics`] instance belongs to each connection manager and is
//! shared with the publishers and receivers it creates. Counters are relaxed
//! atomics; a [`MetricsSnapshot`] is a point-in-time copy suitable for
//! serialization.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Default)]
pub struct ServiceMetrics {
    // Connection lifecycle
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    reconnections: AtomicU64,
    reconnection_attempts: AtomicU64,
    service_interruptions: AtomicU64,
    connected_since_ms: AtomicU64,

    // Publishing
    messages_accepted: AtomicU64,
    messages_rejected: AtomicU64,
    messages_sent: AtomicU64,
    publish_failures: AtomicU64,

    // Receiving
    messages_received: AtomicU64,
    messages_delivered: AtomicU64,
    messages_discarded: AtomicU64,

    listener_faults: AtomicU64,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connected(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connected_since_ms
            .store(current_timestamp_ms(), Ordering::Relaxed);
    }

    pub fn record_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.connected_since_ms.store(0, Ordering::Relaxed);
    }

    pub fn record_reconnection(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnection_attempt(&self) {
        self.reconnection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_service_interruption(&self) {
        self.service_interruptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_accepted(&self) {
        self.messages_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_discarded(&self) {
        self.messages_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_listener_fault(&self) {
        self.listener_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp_ms();
        let since = self.connected_since_ms.load(Ordering::Relaxed);
        let uptime_ms = if since == 0 { 0 } else { now.saturating_sub(since) };

        MetricsSnapshot {
            connection: ConnectionMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                reconnections: self.reconnections.load(Ordering::Relaxed),
                reconnection_attempts: self.reconnection_attempts.load(Ordering::Relaxed),
                service_interruptions: self.service_interruptions.load(Ordering::Relaxed),
                uptime_ms,
            },
            publisher: PublisherMetrics {
                messages_accepted: self.messages_accepted.load(Ordering::Relaxed),
                messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
                messages_sent: self.messages_sent.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
            },
            receiver: ReceiverMetrics {
                messages_received: self.messages_received.load(Ordering::Relaxed),
                messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
                messages_discarded: self.messages_discarded.load(Ordering::Relaxed),
            },
            listener_faults: self.listener_faults.load(Ordering::Relaxed),
            timestamp: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connection: ConnectionMetrics,
    pub publisher: PublisherMetrics,
    pub receiver: ReceiverMetrics,
    pub listener_faults: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub reconnections: u64,
    pub reconnection_attempts: u64,
    pub service_interruptions: u64,
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublisherMetrics {
    pub messages_accepted: u64,
    pub messages_rejected: u64,
    pub messages_sent: u64,
    pub publish_failures: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceiverMetrics {
    pub messages_received: u64,
    pub messages_delivered: u64,
    pub messages_discarded: u64,
}

fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_metrics_are_zero() {
        let snapshot = ServiceMetrics::new().snapshot();
        assert!(!snapshot.connection.connected);
        assert_eq!(snapshot.connection.connection_attempts, 0);
        assert_eq!(snapshot.connection.uptime_ms, 0);
        assert_eq!(snapshot.publisher.messages_sent, 0);
        assert_eq!(snapshot.listener_faults, 0);
    }

    #[test]
    fn test_connection_counters() {
        let metrics = ServiceMetrics::new();
        metrics.record_connection_attempt();
        metrics.record_connected();
        metrics.record_reconnection_attempt();
        metrics.record_reconnection_attempt();
        metrics.record_reconnection();

        let snapshot = metrics.snapshot();
        assert!(snapshot.connection.connected);
        assert_eq!(snapshot.connection.connection_attempts, 1);
        assert_eq!(snapshot.connection.connections_established, 1);
        assert_eq!(snapshot.connection.reconnection_attempts, 2);
        assert_eq!(snapshot.connection.reconnections, 1);

        metrics.record_disconnected();
        let snapshot = metrics.snapshot();
        assert!(!snapshot.connection.connected);
        assert_eq!(snapshot.connection.uptime_ms, 0);
    }

    #[test]
    fn test_message_counters() {
        let metrics = ServiceMetrics::new();
        metrics.record_message_accepted();
        metrics.record_message_accepted();
        metrics.record_message_sent();
        metrics.record_message_rejected();
        metrics.record_publish_failure();
        metrics.record_message_received();
        metrics.record_message_delivered();
        metrics.record_message_discarded();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.publisher.messages_accepted, 2);
        assert_eq!(snapshot.publisher.messages_sent, 1);
        assert_eq!(snapshot.publisher.messages_rejected, 1);
        assert_eq!(snapshot.publisher.publish_failures, 1);
        assert_eq!(snapshot.receiver.messages_received, 1);
        assert_eq!(snapshot.receiver.messages_delivered, 1);
        assert_eq!(snapshot.receiver.messages_discarded, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ServiceMetrics::new();
        metrics.record_listener_fault();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["listener_faults"], 1);
        assert_eq!(json["connection"]["connected"], false);
    }
}
