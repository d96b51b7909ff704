//! Reconnection behavior of the connection manager
//!
//! Every test drives a real manager over the in-memory transport: the
//! session is dropped on purpose and the retry strategy decides what happens.

mod test_helpers;

use proptest::prelude::*;
use pubsub_direct::events::ListenerFault;
use pubsub_direct::{
    listener_fn, ConnectionState, ListenerError, ListenerRole, RetryStrategy, ServiceEvent,
    TransportError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_helpers::{eventually, mock_manager, wait_for_state, EventLog};

fn reset() -> TransportError {
    TransportError::Closed("connection reset by peer".to_string())
}

fn unreachable() -> TransportError {
    TransportError::Unreachable("connection refused".to_string())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(4))]

    #[test]
    fn parametrized_retry_emits_one_event_per_attempt(max_attempts in 1u32..5) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let (manager, transport) = mock_manager(RetryStrategy::parametrized_retry(
                max_attempts,
                Duration::from_millis(5),
            ));
            let log = EventLog::default();
            log.attach(&manager);
            manager.connect().await.unwrap();
            transport.fail_next_opens(100, unreachable());

            transport.drop_link(reset()).await;
            wait_for_state(&manager, ConnectionState::Failed, Duration::from_secs(5)).await;
            assert!(
                eventually(Duration::from_secs(1), || {
                    log.count(ListenerRole::ServiceInterruption) == 1
                })
                .await
            );

            let mut expected: Vec<_> = (1..=max_attempts)
                .map(|attempt| (ListenerRole::ReconnectionAttempt, attempt))
                .collect();
            expected.push((ListenerRole::ServiceInterruption, max_attempts));
            assert_eq!(log.entries(), expected);
            assert_eq!(transport.open_attempts(), 1 + max_attempts as usize);
        });
    }
}

#[tokio::test]
async fn test_never_retry_fails_on_first_drop() {
    let (manager, transport) = mock_manager(RetryStrategy::never_retry());
    let log = EventLog::default();
    log.attach(&manager);
    manager.connect().await.unwrap();

    let mut states = manager.watch_state();
    transport.drop_link(reset()).await;
    states.changed().await.unwrap();

    assert_eq!(*states.borrow(), ConnectionState::Failed);
    assert!(
        eventually(Duration::from_secs(1), || {
            log.count(ListenerRole::ServiceInterruption) == 1
        })
        .await
    );
    assert_eq!(log.count(ListenerRole::ReconnectionAttempt), 0);
    assert_eq!(transport.open_attempts(), 1);
    assert_eq!(manager.last_cause(), Some(reset()));
}

#[tokio::test]
async fn test_reconnect_after_two_failures() {
    let (manager, transport) =
        mock_manager(RetryStrategy::parametrized_retry(3, Duration::from_secs(1)));
    let log = EventLog::default();
    log.attach(&manager);
    manager.connect().await.unwrap();
    transport.fail_next_opens(2, unreachable());

    transport.drop_link(reset()).await;
    wait_for_state(&manager, ConnectionState::Reconnecting, Duration::from_secs(1)).await;
    wait_for_state(&manager, ConnectionState::Connected, Duration::from_secs(10)).await;
    assert!(
        eventually(Duration::from_secs(1), || {
            log.count(ListenerRole::Reconnection) == 1
        })
        .await
    );

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.attempt_number(), 0);
    assert_eq!(
        log.entries(),
        vec![
            (ListenerRole::ReconnectionAttempt, 1),
            (ListenerRole::ReconnectionAttempt, 2),
            (ListenerRole::Reconnection, 3),
        ]
    );

    let snapshot = manager.metrics().snapshot();
    assert_eq!(snapshot.connection.reconnections, 1);
    assert_eq!(snapshot.connection.reconnection_attempts, 2);
}

#[tokio::test]
async fn test_disconnect_twice_closes_once() {
    let (manager, transport) = mock_manager(RetryStrategy::never_retry());
    manager.connect().await.unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut states = manager.watch_state();
    let recorder = {
        let seen = seen.clone();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                seen.lock().unwrap().push(state);
                if state == ConnectionState::Disconnected {
                    break;
                }
            }
        })
    };

    manager.disconnect().await.unwrap();
    manager.disconnect().await.unwrap();
    recorder.await.unwrap();

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(transport.close_count(), 1);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.last(), Some(&ConnectionState::Disconnected));
    assert_eq!(
        seen.iter()
            .filter(|s| **s == ConnectionState::Disconnected)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_failing_listener_does_not_starve_the_next() {
    let (manager, transport) =
        mock_manager(RetryStrategy::parametrized_retry(1, Duration::from_millis(5)));
    let faults = Arc::new(Mutex::new(Vec::new()));
    {
        let faults = faults.clone();
        manager.set_listener_error_observer(Arc::new(move |fault: &ListenerFault| {
            faults.lock().unwrap().push(fault.clone());
        }));
    }

    let delivered = Arc::new(AtomicUsize::new(0));
    manager.add_reconnection_attempt_listener(listener_fn(|_: &ServiceEvent| {
        Err(ListenerError::failed("listener bug"))
    }));
    {
        let delivered = delivered.clone();
        manager.add_reconnection_attempt_listener(listener_fn(move |_: &ServiceEvent| {
            delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
    }
    manager.connect().await.unwrap();
    transport.fail_next_opens(1, unreachable());

    transport.drop_link(reset()).await;
    wait_for_state(&manager, ConnectionState::Failed, Duration::from_secs(2)).await;

    assert!(eventually(Duration::from_secs(1), || delivered.load(Ordering::SeqCst) == 1).await);
    let faults = faults.lock().unwrap();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].role, ListenerRole::ReconnectionAttempt);
    assert_eq!(faults[0].error, ListenerError::failed("listener bug"));
}

#[tokio::test]
async fn test_disconnect_force_cancels_reconnection_episode() {
    let (manager, transport) = mock_manager(RetryStrategy::forever_retry(Duration::from_millis(20)));
    let log = EventLog::default();
    log.attach(&manager);
    manager.connect().await.unwrap();
    transport.fail_next_opens(1000, unreachable());

    transport.drop_link(reset()).await;
    wait_for_state(&manager, ConnectionState::Reconnecting, Duration::from_secs(1)).await;
    assert!(
        eventually(Duration::from_secs(2), || {
            log.count(ListenerRole::ReconnectionAttempt) >= 2
        })
        .await
    );

    manager.disconnect_force().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    let attempts = transport.open_attempts();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.open_attempts(), attempts);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(log.count(ListenerRole::ServiceInterruption), 0);
    assert!(transport.abort_count() >= 1);
}

#[tokio::test]
async fn test_connect_again_after_interruption() {
    let (manager, transport) = mock_manager(RetryStrategy::never_retry());
    manager.connect().await.unwrap();

    transport.drop_link(reset()).await;
    wait_for_state(&manager, ConnectionState::Failed, Duration::from_secs(1)).await;

    manager.connect().await.unwrap();
    assert!(manager.is_connected());
    assert_eq!(manager.last_cause(), None);
}

#[tokio::test]
async fn test_concurrent_connects_open_one_session() {
    let (manager, transport) = mock_manager(RetryStrategy::never_retry());

    let results = futures::future::join_all((0..4).map(|_| manager.connect())).await;

    assert!(results.iter().all(Result::is_ok));
    assert!(manager.is_connected());
    assert_eq!(transport.open_attempts(), 1);
}
