//! Direct (at-most-once) receiving
//!
//! A [`DirectReceiver`] owns a set of topic subscriptions, keeps them
//! installed across reconnections and delivers matching inbound messages to
//! one handler through a bounded queue. When the queue is full the session
//! read loop waits, so nothing is dropped on the floor.

use crate::config::ReceiverConfig;
use crate::connection::session::{SessionListener, SessionRegistry};
use crate::connection::ConnectionState;
use crate::error::{ClientError, ClientResult};
use crate::events::panic_message;
use crate::message::InboundMessage;
use crate::observability::metrics::ServiceMetrics;
use crate::topic::TopicSubscription;
use crate::transport::Transport;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Callback for received messages
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, message: InboundMessage);
}

impl<F> MessageHandler for F
where
    F: Fn(InboundMessage) + Send + Sync + 'static,
{
    fn on_message(&self, message: InboundMessage) {
        self(message)
    }
}

type SharedHandler = Option<Arc<dyn MessageHandler>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    NotStarted,
    Started,
    Terminated,
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Shared between the receiver handle and the session registry
struct ReceiverCore {
    state: Mutex<ReceiverState>,
    subscriptions: tokio::sync::Mutex<Vec<TopicSubscription>>,
    transport: Arc<dyn Transport>,
    connection: watch::Receiver<ConnectionState>,
    deliveries: mpsc::Sender<InboundMessage>,
    metrics: Arc<ServiceMetrics>,
}

impl ReceiverCore {
    fn state(&self) -> ReceiverState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_up(&self) -> bool {
        self.connection.borrow().is_connected()
    }

    /// Install every held subscription in insertion order
    async fn install_all(&self) {
        let subscriptions = self.subscriptions.lock().await;
        for subscription in subscriptions.iter() {
            if let Err(e) = self.transport.subscribe(subscription).await {
                warn!(subscription = %subscription, error = %e, "Failed to install subscription");
            }
        }
        debug!(count = subscriptions.len(), "Subscriptions installed");
    }
}

#[async_trait]
impl SessionListener for ReceiverCore {
    async fn on_session_established(&self) {
        if self.state() == ReceiverState::Started {
            self.install_all().await;
        }
    }

    async fn on_inbound(&self, message: &InboundMessage) {
        if self.state() != ReceiverState::Started {
            return;
        }
        let wanted = self
            .subscriptions
            .lock()
            .await
            .iter()
            .any(|s| s.matches(&message.destination));
        if !wanted {
            return;
        }

        self.metrics.record_message_received();
        if self.deliveries.send(message.clone()).await.is_err() {
            self.metrics.record_message_discarded();
        }
    }
}

struct DeliveryTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Subscription holder and asynchronous message dispatcher
pub struct DirectReceiver {
    core: Arc<ReceiverCore>,
    registry: Arc<SessionRegistry>,
    registration: Mutex<Option<u64>>,
    handler: watch::Sender<SharedHandler>,
    delivery_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    delivery: tokio::sync::Mutex<Option<DeliveryTask>>,
    queue_capacity: usize,
}

impl fmt::Debug for DirectReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectReceiver")
            .field("state", &self.core.state())
            .finish_non_exhaustive()
    }
}

impl DirectReceiver {
    pub(crate) fn new(
        config: &ReceiverConfig,
        subscriptions: Vec<TopicSubscription>,
        transport: Arc<dyn Transport>,
        connection: watch::Receiver<ConnectionState>,
        registry: Arc<SessionRegistry>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        let mut unique: Vec<TopicSubscription> = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            if !unique.contains(&subscription) {
                unique.push(subscription);
            }
        }

        let (deliveries, delivery_rx) = mpsc::channel(config.delivery_queue_capacity);
        let (handler, _) = watch::channel(None);

        Self {
            core: Arc::new(ReceiverCore {
                state: Mutex::new(ReceiverState::NotStarted),
                subscriptions: tokio::sync::Mutex::new(unique),
                transport,
                connection,
                deliveries,
                metrics,
            }),
            registry,
            registration: Mutex::new(None),
            handler,
            delivery_rx: Mutex::new(Some(delivery_rx)),
            delivery: tokio::sync::Mutex::new(None),
            queue_capacity: config.delivery_queue_capacity,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.core.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ReceiverState::Started
    }

    /// Held subscriptions in insertion order
    pub async fn subscriptions(&self) -> Vec<TopicSubscription> {
        self.core.subscriptions.lock().await.clone()
    }

    /// Set the handler, replacing any previous one
    pub fn receive_async(&self, handler: impl MessageHandler) {
        self.handler.send_replace(Some(Arc::new(handler)));
    }

    /// Register with the session and install held subscriptions if a
    /// session is live; otherwise they go in on the next connect
    pub async fn start(&self) -> ClientResult<()> {
        {
            let mut state = self.core.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                ReceiverState::Started => return Ok(()),
                ReceiverState::Terminated => {
                    return Err(ClientError::illegal_state("start receiver", *state))
                }
                ReceiverState::NotStarted => *state = ReceiverState::Started,
            }
        }

        let listener: Arc<dyn SessionListener> = self.core.clone();
        let weak: Weak<dyn SessionListener> = Arc::downgrade(&listener);
        let id = self.registry.register(weak);
        *self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(id);

        let rx = self
            .delivery_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(rx) = rx {
            let (cancel, cancel_rx) = watch::channel(false);
            let handle = tokio::spawn(
                delivery_loop(
                    rx,
                    self.handler.subscribe(),
                    cancel_rx,
                    self.core.metrics.clone(),
                )
                .instrument(crate::receive_span!(capacity = self.queue_capacity)),
            );
            *self.delivery.lock().await = Some(DeliveryTask { cancel, handle });
        }

        if self.core.session_up() {
            self.core.install_all().await;
        }

        info!(
            subscriptions = self.core.subscriptions.lock().await.len(),
            "Direct receiver started"
        );
        Ok(())
    }

    /// Add a subscription; a duplicate is a no-op
    ///
    /// Installed right away when started on a live session, otherwise held
    /// until the next connect. A failed immediate install is not kept.
    pub async fn add_subscription(&self, subscription: TopicSubscription) -> ClientResult<()> {
        if self.state() == ReceiverState::Terminated {
            return Err(ClientError::illegal_state(
                "add subscription",
                ReceiverState::Terminated,
            ));
        }

        let mut subscriptions = self.core.subscriptions.lock().await;
        if subscriptions.contains(&subscription) {
            return Ok(());
        }

        if self.is_running() && self.core.session_up() {
            self.core.transport.subscribe(&subscription).await?;
        } else {
            debug!(subscription = %subscription, "Subscription queued until connected");
        }
        subscriptions.push(subscription);
        Ok(())
    }

    /// Remove a subscription; messages on it stop being delivered at once
    pub async fn remove_subscription(&self, subscription: &TopicSubscription) -> ClientResult<()> {
        let mut subscriptions = self.core.subscriptions.lock().await;
        let before = subscriptions.len();
        subscriptions.retain(|s| s != subscription);
        if subscriptions.len() == before {
            return Ok(());
        }

        if self.is_running() && self.core.session_up() {
            if let Err(e) = self.core.transport.unsubscribe(subscription).await {
                warn!(subscription = %subscription, error = %e, "Broker unsubscribe failed");
            }
        }
        Ok(())
    }

    /// Stop receiving, withdraw subscriptions and discard queued messages
    pub async fn terminate(&self) {
        let was_running = {
            let mut state = self.core.state.lock().unwrap_or_else(PoisonError::into_inner);
            let was_running = *state == ReceiverState::Started;
            *state = ReceiverState::Terminated;
            was_running
        };
        if !was_running {
            return;
        }

        if let Some(id) = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            self.registry.unregister(id);
        }

        if self.core.session_up() {
            for subscription in self.core.subscriptions.lock().await.iter() {
                if let Err(e) = self.core.transport.unsubscribe(subscription).await {
                    debug!(subscription = %subscription, error = %e, "Unsubscribe on terminate failed");
                }
            }
        }

        if let Some(delivery) = self.delivery.lock().await.take() {
            let _ = delivery.cancel.send(true);
            if let Err(e) = delivery.handle.await {
                if !e.is_cancelled() {
                    warn!("Delivery task ended abnormally: {}", e);
                }
            }
        }
        info!("Direct receiver terminated");
    }
}

impl Drop for DirectReceiver {
    fn drop(&mut self) {
        if let Some(id) = self
            .registration
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            self.registry.unregister(id);
        }
        if let Some(delivery) = self.delivery.get_mut().take() {
            let _ = delivery.cancel.send(true);
            delivery.handle.abort();
        }
    }
}

/// Hand queued messages to the handler one at a time, in arrival order
async fn delivery_loop(
    mut messages: mpsc::Receiver<InboundMessage>,
    mut handler: watch::Receiver<SharedHandler>,
    mut cancel: watch::Receiver<bool>,
    metrics: Arc<ServiceMetrics>,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.changed() => break,
            message = messages.recv() => message,
        };
        let Some(message) = message else {
            break;
        };

        // Hold messages until a handler is set
        let current = loop {
            let current = handler.borrow_and_update().clone();
            if let Some(current) = current {
                break current;
            }
            tokio::select! {
                _ = cancel.changed() => {
                    metrics.record_message_discarded();
                    discard_remaining(&mut messages, &metrics);
                    return;
                }
                changed = handler.changed() => {
                    if changed.is_err() {
                        metrics.record_message_discarded();
                        return;
                    }
                }
            }
        };

        let destination = message.destination.clone();
        match tokio::task::spawn_blocking(move || current.on_message(message)).await {
            Ok(()) => metrics.record_message_delivered(),
            Err(e) if e.is_panic() => {
                metrics.record_message_discarded();
                error!(
                    destination = %destination,
                    panic = %panic_message(e.into_panic()),
                    "Message handler panicked"
                );
            }
            Err(e) => warn!(destination = %destination, "Message handler task failed: {}", e),
        }
    }

    discard_remaining(&mut messages, &metrics);
    debug!("Delivery task stopped");
}

fn discard_remaining(messages: &mut mpsc::Receiver<InboundMessage>, metrics: &ServiceMetrics) {
    messages.close();
    let mut discarded = 0usize;
    while messages.try_recv().is_ok() {
        metrics.record_message_discarded();
        discarded += 1;
    }
    if discarded > 0 {
        debug!(discarded, "Discarded undelivered messages");
    }
}
