//! Mock transport for testing
//!
//! [`MockTransport`] records every request the runtime makes and lets a test
//! script handshake outcomes, drop the live session, inject inbound messages
//! and stall or fail sends, all without a broker.

use crate::message::{InboundMessage, OutboundMessage};
use crate::topic::TopicSubscription;
use crate::transport::{LinkEvent, Transport, TransportError, TransportLink, LINK_CHANNEL_CAPACITY};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Scriptable in-memory transport
#[derive(Debug)]
pub struct MockTransport {
    broker_uri: String,
    link_capacity: usize,
    open_script: Mutex<VecDeque<Result<(), TransportError>>>,
    open_delay: Mutex<Option<Duration>>,
    open_attempts: AtomicUsize,
    subscribe_delay: Mutex<Option<Duration>>,
    link: Mutex<Option<mpsc::Sender<LinkEvent>>>,
    subscribe_requests: Mutex<Vec<String>>,
    unsubscribe_requests: Mutex<Vec<String>>,
    sent: Mutex<Vec<OutboundMessage>>,
    send_attempts: AtomicUsize,
    send_failure: Mutex<Option<TransportError>>,
    stalled: watch::Sender<bool>,
    closes: AtomicUsize,
    aborts: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_link_capacity(LINK_CHANNEL_CAPACITY)
    }

    /// Small capacities make read-path back-pressure observable
    pub fn with_link_capacity(link_capacity: usize) -> Self {
        let (stalled, _) = watch::channel(false);
        Self {
            broker_uri: "tcp://mock-broker:1883".to_string(),
            link_capacity,
            open_script: Mutex::new(VecDeque::new()),
            open_delay: Mutex::new(None),
            open_attempts: AtomicUsize::new(0),
            subscribe_delay: Mutex::new(None),
            link: Mutex::new(None),
            subscribe_requests: Mutex::new(Vec::new()),
            unsubscribe_requests: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            send_attempts: AtomicUsize::new(0),
            send_failure: Mutex::new(None),
            stalled,
            closes: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
        }
    }

    /// Queue handshake outcomes; once the script runs out, opens succeed
    pub fn script_opens<I>(&self, outcomes: I)
    where
        I: IntoIterator<Item = Result<(), TransportError>>,
    {
        locked(&self.open_script).extend(outcomes);
    }

    /// Make the next `count` handshakes fail with `error`
    pub fn fail_next_opens(&self, count: usize, error: TransportError) {
        self.script_opens(std::iter::repeat(Err(error)).take(count));
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *locked(&self.open_delay) = Some(delay);
    }

    /// Hold every subscribe request for `delay` before answering
    pub fn set_subscribe_delay(&self, delay: Duration) {
        *locked(&self.subscribe_delay) = Some(delay);
    }

    /// End the live session as if the network dropped it
    pub async fn drop_link(&self, cause: TransportError) {
        let sender = locked(&self.link).take();
        if let Some(sender) = sender {
            let _ = sender.send(LinkEvent::Dropped(cause)).await;
        }
    }

    /// Push a message through the live session; waits while the link is full
    pub async fn inject(&self, message: InboundMessage) -> bool {
        let sender = locked(&self.link).clone();
        match sender {
            Some(sender) => sender.send(LinkEvent::Inbound(message)).await.is_ok(),
            None => false,
        }
    }

    /// Non-blocking variant of [`MockTransport::inject`]
    pub fn try_inject(&self, message: InboundMessage) -> bool {
        locked(&self.link)
            .as_ref()
            .is_some_and(|sender| sender.try_send(LinkEvent::Inbound(message)).is_ok())
    }

    /// Block every send until [`MockTransport::release_sends`]
    pub fn stall_sends(&self) {
        self.stalled.send_replace(true);
    }

    pub fn release_sends(&self) {
        self.stalled.send_replace(false);
    }

    pub fn fail_sends(&self, error: TransportError) {
        *locked(&self.send_failure) = Some(error);
    }

    pub fn clear_send_failure(&self) {
        *locked(&self.send_failure) = None;
    }

    pub fn is_open(&self) -> bool {
        locked(&self.link).is_some()
    }

    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    /// Subscription requests accepted while a session was open, in order
    pub fn subscribe_requests(&self) -> Vec<String> {
        locked(&self.subscribe_requests).clone()
    }

    pub fn unsubscribe_requests(&self) -> Vec<String> {
        locked(&self.unsubscribe_requests).clone()
    }

    pub fn sent_messages(&self) -> Vec<OutboundMessage> {
        locked(&self.sent).clone()
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn clear_history(&self) {
        locked(&self.subscribe_requests).clear();
        locked(&self.unsubscribe_requests).clear();
        locked(&self.sent).clear();
        self.send_attempts.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self) -> Result<TransportLink, TransportError> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *locked(&self.open_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = locked(&self.open_script).pop_front().unwrap_or(Ok(()));
        outcome?;

        let (sender, link) = TransportLink::channel(self.link_capacity);
        *locked(&self.link) = Some(sender);
        Ok(link)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        locked(&self.link).take();
        Ok(())
    }

    async fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        locked(&self.link).take();
    }

    async fn subscribe(&self, subscription: &TopicSubscription) -> Result<(), TransportError> {
        let delay = *locked(&self.subscribe_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        locked(&self.subscribe_requests).push(subscription.as_str().to_string());
        Ok(())
    }

    async fn unsubscribe(&self, subscription: &TopicSubscription) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        locked(&self.unsubscribe_requests).push(subscription.as_str().to_string());
        Ok(())
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);

        let mut stalled = self.stalled.subscribe();
        while *stalled.borrow_and_update() {
            if stalled.changed().await.is_err() {
                break;
            }
        }

        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        if let Some(error) = locked(&self.send_failure).clone() {
            return Err(error);
        }

        locked(&self.sent).push(message.clone());
        Ok(())
    }

    fn broker_uri(&self) -> String {
        self.broker_uri.clone()
    }
}
