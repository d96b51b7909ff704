//! Direct (fire-and-forget) publishing
//!
//! A [`DirectPublisher`] validates the session state, hands messages to a
//! [`BackpressureBuffer`] and lets a background drain task push them to the
//! transport. Every message that does not make it (rejected up front, given
//! up on by the drain task, or discarded on terminate) produces one
//! [`FailedPublishEvent`] for the registered [`PublishFailureListener`].

pub mod buffer;

pub use buffer::{
    BackPressurePolicy, BackpressureBuffer, PublishFailureCause, PublishOutcome, Rejected,
};

use crate::config::PublisherConfig;
use crate::connection::ConnectionState;
use crate::error::{ClientError, ClientResult};
use crate::events::invoke_isolated;
use crate::message::{Message, OutboundMessage};
use crate::observability::metrics::ServiceMetrics;
use crate::topic::Topic;
use crate::transport::{Transport, TransportError};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// A message that did not reach the transport
#[derive(Debug, Clone, PartialEq)]
pub struct FailedPublishEvent {
    pub destination: Topic,
    pub message: Message,
    pub timestamp: DateTime<Utc>,
    pub cause: PublishFailureCause,
}

impl FailedPublishEvent {
    fn new(outbound: OutboundMessage, cause: PublishFailureCause) -> Self {
        Self {
            destination: outbound.destination,
            message: outbound.message,
            timestamp: Utc::now(),
            cause,
        }
    }
}

/// Callback for messages that failed to publish
pub trait PublishFailureListener: Send + Sync + 'static {
    fn on_failed_publish(&self, event: &FailedPublishEvent);
}

impl<F> PublishFailureListener for F
where
    F: Fn(&FailedPublishEvent) + Send + Sync + 'static,
{
    fn on_failed_publish(&self, event: &FailedPublishEvent) {
        self(event)
    }
}

type SharedFailureListener = Arc<RwLock<Option<Arc<dyn PublishFailureListener>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    NotStarted,
    Started,
    Terminating,
    Terminated,
}

impl fmt::Display for PublisherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Everything the drain task needs, cloned out of the publisher
#[derive(Clone)]
struct DrainContext {
    buffer: Arc<BackpressureBuffer>,
    transport: Arc<dyn Transport>,
    connection: watch::Receiver<ConnectionState>,
    failures: mpsc::UnboundedSender<FailedPublishEvent>,
    metrics: Arc<ServiceMetrics>,
    send_retries: u32,
    send_retry_interval: Duration,
}

struct DrainTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Fire-and-forget publisher bound to one connection manager
pub struct DirectPublisher {
    state: Mutex<PublisherState>,
    config: PublisherConfig,
    context: DrainContext,
    drain: tokio::sync::Mutex<Option<DrainTask>>,
    failure_listener: SharedFailureListener,
    failure_rx: Mutex<Option<mpsc::UnboundedReceiver<FailedPublishEvent>>>,
    notifier: Mutex<Option<JoinHandle<()>>>,
    dispatch_timeout: Duration,
}

impl fmt::Debug for DirectPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectPublisher")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DirectPublisher {
    pub(crate) fn new(
        config: PublisherConfig,
        transport: Arc<dyn Transport>,
        connection: watch::Receiver<ConnectionState>,
        metrics: Arc<ServiceMetrics>,
        dispatch_timeout: Duration,
    ) -> Self {
        let (failures, failure_rx) = mpsc::unbounded_channel();
        let buffer = Arc::new(BackpressureBuffer::new(
            config.buffer_capacity,
            config.back_pressure,
        ));

        Self {
            state: Mutex::new(PublisherState::NotStarted),
            context: DrainContext {
                buffer,
                transport,
                connection,
                failures,
                metrics,
                send_retries: config.send_retries,
                send_retry_interval: config.send_retry_interval,
            },
            config,
            drain: tokio::sync::Mutex::new(None),
            failure_listener: Arc::new(RwLock::new(None)),
            failure_rx: Mutex::new(Some(failure_rx)),
            notifier: Mutex::new(None),
            dispatch_timeout,
        }
    }

    pub fn state(&self) -> PublisherState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.state() == PublisherState::Started
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == PublisherState::Terminated
    }

    /// Messages queued or in flight
    pub fn buffered(&self) -> usize {
        self.context.buffer.occupied()
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Replace the failure listener; `None`-like behavior until one is set
    pub fn set_publish_failure_listener(&self, listener: impl PublishFailureListener) {
        *self
            .failure_listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
    }

    /// Begin accepting messages and start the drain task
    pub async fn start(&self) -> ClientResult<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                PublisherState::Started => return Ok(()),
                PublisherState::Terminating | PublisherState::Terminated => {
                    return Err(ClientError::illegal_state("start publisher", *state))
                }
                PublisherState::NotStarted => *state = PublisherState::Started,
            }
        }

        self.ensure_notifier();

        let (cancel, cancel_rx) = watch::channel(false);
        let context = self.context.clone();
        let handle = tokio::spawn(
            drain_loop(context, cancel_rx)
                .instrument(crate::publish_span!(capacity = self.config.buffer_capacity)),
        );
        *self.drain.lock().await = Some(DrainTask { cancel, handle });

        info!(
            capacity = self.config.buffer_capacity,
            policy = ?self.config.back_pressure,
            "Direct publisher started"
        );
        Ok(())
    }

    /// Submit a message for `destination`
    ///
    /// Never errors: refusal is reported through the outcome and the
    /// failure listener.
    pub async fn publish(&self, destination: &Topic, message: impl Into<Message>) -> PublishOutcome {
        let outbound = OutboundMessage::new(destination.clone(), message.into());

        match self.state() {
            PublisherState::Started => {}
            PublisherState::NotStarted => {
                return self.reject(outbound, PublishFailureCause::NotConnected)
            }
            PublisherState::Terminating | PublisherState::Terminated => {
                return self.reject(outbound, PublishFailureCause::Terminated)
            }
        }

        let connection = *self.context.connection.borrow();
        // While reconnecting only a blocking publisher may queue
        let may_buffer = connection.is_session_alive()
            && (connection.is_connected()
                || matches!(self.config.back_pressure, BackPressurePolicy::Block(_)));
        if !may_buffer {
            return self.reject(outbound, PublishFailureCause::NotConnected);
        }

        match self.context.buffer.submit(outbound).await {
            Ok(()) => {
                self.context.metrics.record_message_accepted();
                PublishOutcome::Accepted
            }
            Err(Rejected { cause, message }) => self.reject(message, cause),
        }
    }

    /// Stop accepting messages, give queued ones up to `grace_period` to be
    /// sent, then discard the rest; returns how many were discarded
    pub async fn terminate(&self, grace_period: Duration) -> usize {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                PublisherState::NotStarted => {
                    *state = PublisherState::Terminated;
                    return 0;
                }
                PublisherState::Terminating | PublisherState::Terminated => return 0,
                PublisherState::Started => *state = PublisherState::Terminating,
            }
        }

        let buffer = &self.context.buffer;
        buffer.close();

        if tokio::time::timeout(grace_period, buffer.wait_idle())
            .await
            .is_err()
        {
            debug!(
                remaining = buffer.occupied(),
                "Grace period elapsed with messages still buffered"
            );
        }

        if let Some(drain) = self.drain.lock().await.take() {
            let _ = drain.cancel.send(true);
            if let Err(e) = drain.handle.await {
                if !e.is_cancelled() {
                    warn!("Drain task ended abnormally: {}", e);
                }
            }
        }

        let discarded = buffer.drain_remaining();
        for outbound in &discarded {
            self.notify_failure(outbound.clone(), PublishFailureCause::Terminated);
        }

        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = PublisherState::Terminated;
        info!(discarded = discarded.len(), "Direct publisher terminated");
        discarded.len()
    }

    fn reject(&self, outbound: OutboundMessage, cause: PublishFailureCause) -> PublishOutcome {
        debug!(destination = %outbound.destination, %cause, "Publish rejected");
        self.context.metrics.record_message_rejected();
        self.notify_failure(outbound, cause);
        PublishOutcome::Rejected { reason: cause }
    }

    fn notify_failure(&self, outbound: OutboundMessage, cause: PublishFailureCause) {
        self.ensure_notifier();
        self.context.metrics.record_publish_failure();
        let _ = self
            .context
            .failures
            .send(FailedPublishEvent::new(outbound, cause));
    }

    /// Spawn the task that invokes the failure listener, once
    fn ensure_notifier(&self) {
        let Some(rx) = self
            .failure_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let handle = tokio::spawn(notify_loop(
            rx,
            self.failure_listener.clone(),
            self.context.metrics.clone(),
            self.dispatch_timeout,
        ));
        *self.notifier.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }
}

impl Drop for DirectPublisher {
    fn drop(&mut self) {
        if let Some(drain) = self.drain.get_mut().take() {
            let _ = drain.cancel.send(true);
            drain.handle.abort();
        }
        // The notifier exits by itself once the queued events are delivered
    }
}

/// Deliver failure events in order, each isolated and time-bounded
async fn notify_loop(
    mut events: mpsc::UnboundedReceiver<FailedPublishEvent>,
    listener: SharedFailureListener,
    metrics: Arc<ServiceMetrics>,
    dispatch_timeout: Duration,
) {
    while let Some(event) = events.recv().await {
        let current = listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(current) = current else {
            debug!(destination = %event.destination, cause = %event.cause, "No publish failure listener set");
            continue;
        };

        let outcome = invoke_isolated(dispatch_timeout, move || {
            current.on_failed_publish(&event);
            Ok(())
        })
        .await;

        if let Err(error) = outcome {
            metrics.record_listener_fault();
            warn!(%error, "Publish failure listener fault");
        }
    }
}

enum SendOutcome {
    Sent,
    Failed(PublishFailureCause),
    Cancelled,
}

async fn drain_loop(context: DrainContext, mut cancel: watch::Receiver<bool>) {
    loop {
        let next = tokio::select! {
            _ = cancel.changed() => break,
            next = context.buffer.next() => next,
        };
        let Some(outbound) = next else {
            break;
        };

        match send_with_retries(&context, &outbound, &mut cancel).await {
            SendOutcome::Sent => {
                context.metrics.record_message_sent();
                context.buffer.complete();
            }
            SendOutcome::Failed(cause) => {
                warn!(destination = %outbound.destination, %cause, "Giving up on message");
                context.metrics.record_publish_failure();
                let _ = context
                    .failures
                    .send(FailedPublishEvent::new(outbound, cause));
                context.buffer.complete();
            }
            SendOutcome::Cancelled => {
                context.buffer.requeue_front(outbound);
                break;
            }
        }
    }
    debug!("Drain task stopped");
}

async fn send_with_retries(
    context: &DrainContext,
    outbound: &OutboundMessage,
    cancel: &mut watch::Receiver<bool>,
) -> SendOutcome {
    let mut failures = 0u32;
    loop {
        let cause = if context.connection.borrow().is_connected() {
            let result = tokio::select! {
                _ = cancel.changed() => return SendOutcome::Cancelled,
                result = context.transport.send(outbound) => result,
            };
            match result {
                Ok(()) => {
                    debug!(destination = %outbound.destination, "Message sent");
                    return SendOutcome::Sent;
                }
                Err(TransportError::NotConnected) => PublishFailureCause::NotConnected,
                Err(e) => {
                    debug!(destination = %outbound.destination, error = %e, "Send failed");
                    PublishFailureCause::TransportRejected
                }
            }
        } else {
            PublishFailureCause::NotConnected
        };

        failures += 1;
        if failures > context.send_retries {
            return SendOutcome::Failed(cause);
        }

        tokio::select! {
            _ = cancel.changed() => return SendOutcome::Cancelled,
            _ = tokio::time::sleep(context.send_retry_interval) => {}
        }
    }
}
