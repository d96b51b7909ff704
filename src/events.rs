//! Lifecycle events and listener dispatch
//!
//! Listeners register per [`ListenerRole`]. One listener object may be
//! registered for several roles; identity is pointer identity of the `Arc`.
//!
//! Every invocation runs on the blocking pool under a timeout. A listener
//! that returns an error, panics or overruns is reported to the error
//! observer and dispatch moves on to the next listener.

use crate::observability::metrics::ServiceMetrics;
use crate::transport::TransportError;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

/// Immutable description of a lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceEvent {
    pub timestamp: DateTime<Utc>,
    pub broker_uri: String,
    pub cause: Option<TransportError>,
    pub message: String,
    pub attempt: u32,
}

impl ServiceEvent {
    pub fn new(
        broker_uri: impl Into<String>,
        cause: Option<TransportError>,
        message: impl AsRef<str>,
        attempt: u32,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            broker_uri: broker_uri.into(),
            cause,
            message: crate::error::sanitize_error_message(message.as_ref()),
            attempt,
        }
    }
}

/// Which lifecycle notification a listener receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerRole {
    /// A reconnection episode ended with a live session
    Reconnection,
    /// One failed attempt inside a reconnection episode
    ReconnectionAttempt,
    /// Retries exhausted or not permitted
    ServiceInterruption,
}

impl fmt::Display for ListenerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListenerRole::Reconnection => "reconnection",
            ListenerRole::ReconnectionAttempt => "reconnection-attempt",
            ListenerRole::ServiceInterruption => "service-interruption",
        };
        f.write_str(name)
    }
}

/// Listener failure, isolated from other listeners
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ListenerError {
    #[error("listener failed: {0}")]
    Failed(String),
    #[error("listener panicked: {0}")]
    Panicked(String),
    #[error("listener did not return within {0:?}")]
    TimedOut(Duration),
}

impl ListenerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

pub type ListenerResult = Result<(), ListenerError>;

/// Callback for lifecycle events
pub trait ServiceListener: Send + Sync + 'static {
    fn on_service_event(&self, event: &ServiceEvent) -> ListenerResult;
}

struct FnListener<F>(F);

impl<F> ServiceListener for FnListener<F>
where
    F: Fn(&ServiceEvent) -> ListenerResult + Send + Sync + 'static,
{
    fn on_service_event(&self, event: &ServiceEvent) -> ListenerResult {
        (self.0)(event)
    }
}

/// Adapt a closure into a shareable listener
pub fn listener_fn<F>(f: F) -> Arc<dyn ServiceListener>
where
    F: Fn(&ServiceEvent) -> ListenerResult + Send + Sync + 'static,
{
    Arc::new(FnListener(f))
}

/// Report handed to the error observer
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerFault {
    pub role: ListenerRole,
    pub error: ListenerError,
}

pub type ErrorObserver = Arc<dyn Fn(&ListenerFault) + Send + Sync>;

fn default_error_observer() -> ErrorObserver {
    Arc::new(|fault: &ListenerFault| {
        error!(role = %fault.role, error = %fault.error, "Listener fault");
    })
}

fn same_listener(a: &Arc<dyn ServiceListener>, b: &Arc<dyn ServiceListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run user callback code on the blocking pool, bounded by `timeout`
///
/// A call that overruns keeps running on its blocking thread; only the
/// caller stops waiting for it.
pub(crate) async fn invoke_isolated<F>(timeout: Duration, call: F) -> ListenerResult
where
    F: FnOnce() -> ListenerResult + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(call);
    match tokio::time::timeout(timeout, handle).await {
        Err(_) => Err(ListenerError::TimedOut(timeout)),
        Ok(Err(join_error)) if join_error.is_panic() => Err(ListenerError::Panicked(
            panic_message(join_error.into_panic()),
        )),
        Ok(Err(join_error)) => Err(ListenerError::Failed(join_error.to_string())),
        Ok(Ok(result)) => result,
    }
}

/// In-process dispatcher for lifecycle events
pub struct EventBus {
    listeners: Mutex<HashMap<ListenerRole, Vec<Arc<dyn ServiceListener>>>>,
    error_observer: RwLock<ErrorObserver>,
    dispatch_timeout: Duration,
    metrics: Option<Arc<ServiceMetrics>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("dispatch_timeout", &self.dispatch_timeout)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new(dispatch_timeout: Duration) -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            error_observer: RwLock::new(default_error_observer()),
            dispatch_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ServiceMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn dispatch_timeout(&self) -> Duration {
        self.dispatch_timeout
    }

    /// Register `listener` for `role`; registering it twice is a no-op
    pub fn subscribe(&self, role: ListenerRole, listener: Arc<dyn ServiceListener>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let registered = listeners.entry(role).or_default();
        if !registered.iter().any(|l| same_listener(l, &listener)) {
            registered.push(listener);
        }
    }

    /// Remove `listener` from `role`; returns whether it was registered
    pub fn unsubscribe(&self, role: ListenerRole, listener: &Arc<dyn ServiceListener>) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(registered) = listeners.get_mut(&role) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|l| !same_listener(l, listener));
        before != registered.len()
    }

    pub fn listener_count(&self, role: ListenerRole) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&role)
            .map_or(0, Vec::len)
    }

    pub fn set_error_observer(&self, observer: ErrorObserver) {
        *self
            .error_observer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = observer;
    }

    /// Deliver `event` to every listener of `role` in registration order
    ///
    /// Returns the number of listeners that handled the event cleanly.
    pub async fn publish(&self, role: ListenerRole, event: ServiceEvent) -> usize {
        let snapshot: Vec<Arc<dyn ServiceListener>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&role)
            .cloned()
            .unwrap_or_default();

        debug!(role = %role, listeners = snapshot.len(), attempt = event.attempt, "Dispatching service event");

        let event = Arc::new(event);
        let mut delivered = 0;
        for listener in snapshot {
            let event = Arc::clone(&event);
            let outcome = invoke_isolated(self.dispatch_timeout, move || {
                listener.on_service_event(&event)
            })
            .await;

            match outcome {
                Ok(()) => delivered += 1,
                Err(error) => self.report_fault(ListenerFault { role, error }),
            }
        }
        delivered
    }

    pub(crate) fn report_fault(&self, fault: ListenerFault) {
        if let Some(metrics) = &self.metrics {
            metrics.record_listener_fault();
        }
        let observer = self
            .error_observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        observer(&fault);
    }
}
