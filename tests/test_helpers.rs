//! Shared helpers for integration tests
//!
//! Builds managers over [`MockTransport`] and records listener traffic.

#![allow(dead_code)]

use pubsub_direct::config::keys;
use pubsub_direct::testing::MockTransport;
use pubsub_direct::{
    listener_fn, BrokerProperties, ConnectionManager, ConnectionState, ListenerRole,
    RetryStrategy, ServiceConfig, ServiceEvent, ServiceListener,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn service_config(strategy: RetryStrategy) -> ServiceConfig {
    ServiceConfig::from_properties(&BrokerProperties::from_pairs([
        (keys::TRANSPORT_HOST, "tcp://localhost:1883"),
        (keys::SERVICE_CLIENT_NAME, "integration"),
    ]))
    .unwrap()
    .with_retry_strategy(strategy)
    .with_connect_timeout(Duration::from_millis(500))
}

pub fn mock_manager(strategy: RetryStrategy) -> (ConnectionManager, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let manager = ConnectionManager::new(service_config(strategy), transport.clone()).unwrap();
    (manager, transport)
}

/// Ordered record of (role, attempt) across every role it is registered for
#[derive(Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<(ListenerRole, u32)>>>,
}

impl EventLog {
    pub fn listener(&self, role: ListenerRole) -> Arc<dyn ServiceListener> {
        let entries = self.entries.clone();
        listener_fn(move |event: &ServiceEvent| {
            entries.lock().unwrap().push((role, event.attempt));
            Ok(())
        })
    }

    pub fn attach(&self, manager: &ConnectionManager) {
        for role in [
            ListenerRole::ReconnectionAttempt,
            ListenerRole::Reconnection,
            ListenerRole::ServiceInterruption,
        ] {
            manager.add_listener(role, self.listener(role));
        }
    }

    pub fn entries(&self) -> Vec<(ListenerRole, u32)> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count(&self, role: ListenerRole) -> usize {
        self.entries().iter().filter(|(r, _)| *r == role).count()
    }
}

/// Wait until the manager reaches `target`, failing the test after `within`
pub async fn wait_for_state(manager: &ConnectionManager, target: ConnectionState, within: Duration) {
    let mut states = manager.watch_state();
    tokio::time::timeout(within, states.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("state {target} not reached; still {}", manager.state()))
        .unwrap();
}

/// Poll `condition` every few milliseconds for up to `within`
pub async fn eventually<F>(within: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
