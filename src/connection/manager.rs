//! Connection lifecycle management
//!
//! [`ConnectionManager`] owns the transport session. `connect` performs the
//! handshake once and never retries it; after a session is up, a supervisor
//! task reads the session's link, forwards inbound traffic to receivers and
//! runs a reconnection episode whenever the session drops.
//!
//! All state changes go through [`ConnectionState::can_transition_to`] under
//! one lock, so a forced disconnect can always cut in: whatever the connect
//! call or the supervisor tries next is refused and they back out.

use super::session::SessionRegistry;
use super::state::{log_state_transition, ConnectionState};
use crate::config::{ConfigError, PublisherConfig, ReceiverConfig, ServiceConfig};
use crate::error::{ClientResult, ConnectError};
use crate::events::{ErrorObserver, EventBus, ListenerRole, ServiceEvent, ServiceListener};
use crate::observability::metrics::ServiceMetrics;
use crate::publisher::DirectPublisher;
use crate::receiver::DirectReceiver;
use crate::topic::TopicSubscription;
use crate::transport::{LinkEvent, MqttTransport, Transport, TransportError, TransportLink};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// How long a graceful disconnect waits for the supervisor before aborting it
const SUPERVISOR_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct Machine {
    state: ConnectionState,
    attempt: u32,
    last_cause: Option<TransportError>,
}

struct Supervisor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    config: ServiceConfig,
    transport: Arc<dyn Transport>,
    broker_uri: String,
    machine: Mutex<Machine>,
    state_tx: watch::Sender<ConnectionState>,
    connect_lock: tokio::sync::Mutex<()>,
    disconnect_lock: tokio::sync::Mutex<()>,
    supervisor: Mutex<Option<Supervisor>>,
    events: EventBus,
    sessions: Arc<SessionRegistry>,
    metrics: Arc<ServiceMetrics>,
}

/// Owner of one broker session and its lifecycle
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("broker", &self.inner.broker_uri)
            .field("state", &self.state())
            .field("retry", &self.inner.config.retry_strategy)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Validate `config` and bind it to `transport`; no network activity
    pub fn new(config: ServiceConfig, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        config.validate()?;

        let metrics = Arc::new(ServiceMetrics::new());
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let events =
            EventBus::new(config.listener_dispatch_timeout).with_metrics(metrics.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                broker_uri: transport.broker_uri(),
                config,
                transport,
                machine: Mutex::new(Machine::default()),
                state_tx,
                connect_lock: tokio::sync::Mutex::new(()),
                disconnect_lock: tokio::sync::Mutex::new(()),
                supervisor: Mutex::new(None),
                events,
                sessions: Arc::new(SessionRegistry::default()),
                metrics,
            }),
        })
    }

    /// Manager over an MQTT v5 transport built from `config`
    pub fn with_mqtt(config: ServiceConfig) -> Result<Self, ConfigError> {
        let transport = MqttTransport::new(&config)?;
        Self::new(config, Arc::new(transport))
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn broker_uri(&self) -> &str {
        &self.inner.broker_uri
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.machine().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Current attempt inside a reconnection episode; 0 outside of one
    pub fn attempt_number(&self) -> u32 {
        self.inner.machine().attempt
    }

    /// Most recent transport failure; cleared by every successful connect
    pub fn last_cause(&self) -> Option<TransportError> {
        self.inner.machine().last_cause.clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn metrics(&self) -> Arc<ServiceMetrics> {
        self.inner.metrics.clone()
    }

    /// Establish the session
    ///
    /// Already connected is success. Handshake failures leave the manager in
    /// `Failed` and are not retried.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.inner.clone().connect().await
    }

    /// Non-blocking form of [`ConnectionManager::connect`]
    pub fn connect_async(&self) -> JoinHandle<Result<(), ConnectError>> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.connect().await })
    }

    /// Close the session gracefully; a no-op when already disconnected
    pub async fn disconnect(&self) -> ClientResult<()> {
        self.inner.disconnect().await
    }

    pub fn disconnect_async(&self) -> JoinHandle<ClientResult<()>> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.disconnect().await })
    }

    /// Hard-terminate the session, cancelling any reconnection episode
    pub async fn disconnect_force(&self) {
        self.inner.disconnect_force().await
    }

    /// Wait until the state is `Connected`, `Failed` or `Disconnected`
    ///
    /// `None` means still unresolved after `timeout` (default:
    /// `reconnection.wait-timeout-ms`).
    pub async fn await_resolution(&self, timeout: Option<Duration>) -> Option<ConnectionState> {
        let timeout = timeout.unwrap_or(self.inner.config.reconnection_wait_timeout);
        let mut states = self.watch_state();
        let resolved = match tokio::time::timeout(timeout, states.wait_for(|s| s.is_resolved())).await {
            Ok(Ok(state)) => Some(*state),
            _ => None,
        };
        resolved
    }

    pub fn add_listener(&self, role: ListenerRole, listener: Arc<dyn ServiceListener>) {
        self.inner.events.subscribe(role, listener);
    }

    pub fn remove_listener(&self, role: ListenerRole, listener: &Arc<dyn ServiceListener>) -> bool {
        self.inner.events.unsubscribe(role, listener)
    }

    pub fn add_reconnection_listener(&self, listener: Arc<dyn ServiceListener>) {
        self.add_listener(ListenerRole::Reconnection, listener);
    }

    pub fn remove_reconnection_listener(&self, listener: &Arc<dyn ServiceListener>) -> bool {
        self.remove_listener(ListenerRole::Reconnection, listener)
    }

    pub fn add_reconnection_attempt_listener(&self, listener: Arc<dyn ServiceListener>) {
        self.add_listener(ListenerRole::ReconnectionAttempt, listener);
    }

    pub fn remove_reconnection_attempt_listener(&self, listener: &Arc<dyn ServiceListener>) -> bool {
        self.remove_listener(ListenerRole::ReconnectionAttempt, listener)
    }

    pub fn add_service_interruption_listener(&self, listener: Arc<dyn ServiceListener>) {
        self.add_listener(ListenerRole::ServiceInterruption, listener);
    }

    pub fn remove_service_interruption_listener(&self, listener: &Arc<dyn ServiceListener>) -> bool {
        self.remove_listener(ListenerRole::ServiceInterruption, listener)
    }

    /// Where listener errors, panics and timeouts are reported
    pub fn set_listener_error_observer(&self, observer: ErrorObserver) {
        self.inner.events.set_error_observer(observer);
    }

    pub fn create_direct_publisher(&self, config: PublisherConfig) -> ClientResult<DirectPublisher> {
        config.validate()?;
        Ok(DirectPublisher::new(
            config,
            self.inner.transport.clone(),
            self.watch_state(),
            self.inner.metrics.clone(),
            self.inner.events.dispatch_timeout(),
        ))
    }

    pub fn create_direct_receiver<I>(
        &self,
        config: ReceiverConfig,
        subscriptions: I,
    ) -> ClientResult<DirectReceiver>
    where
        I: IntoIterator<Item = TopicSubscription>,
    {
        config.validate()?;
        Ok(DirectReceiver::new(
            &config,
            subscriptions.into_iter().collect(),
            self.inner.transport.clone(),
            self.watch_state(),
            self.inner.sessions.clone(),
            self.inner.metrics.clone(),
        ))
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(supervisor) = self.inner.take_supervisor() {
            let _ = supervisor.shutdown.send(true);
            supervisor.handle.abort();
        }
    }
}

impl Inner {
    fn machine(&self) -> std::sync::MutexGuard<'_, Machine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        self.machine().state
    }

    /// Apply a transition if the table allows it; `Err` carries the state
    /// that refused it
    fn transition(&self, to: ConnectionState) -> Result<ConnectionState, ConnectionState> {
        let from = {
            let mut machine = self.machine();
            let from = machine.state;
            if !from.can_transition_to(to) {
                debug!(from = %from, to = %to, "Transition refused");
                return Err(from);
            }
            machine.state = to;
            self.state_tx.send_replace(to);
            from
        };

        log_state_transition(&self.broker_uri, from, to);
        match to {
            ConnectionState::Connected => self.metrics.record_connected(),
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.metrics.record_disconnected()
            }
            _ => {}
        }
        Ok(from)
    }

    fn set_attempt(&self, attempt: u32) {
        self.machine().attempt = attempt;
    }

    fn record_cause(&self, cause: &TransportError) {
        self.machine().last_cause = Some(cause.clone());
    }

    fn session_restored(&self) {
        let mut machine = self.machine();
        machine.attempt = 0;
        machine.last_cause = None;
    }

    fn take_supervisor(&self) -> Option<Supervisor> {
        self.supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn open_with_timeout(&self) -> Result<TransportLink, TransportError> {
        match tokio::time::timeout(self.config.connect_timeout, self.transport.open()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn connect(self: Arc<Self>) -> Result<(), ConnectError> {
        let _guard = self.connect_lock.lock().await;

        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Disconnected | ConnectionState::Failed => {}
            other => return Err(ConnectError::InvalidState(other)),
        }
        self.transition(ConnectionState::Connecting)
            .map_err(ConnectError::InvalidState)?;

        // Let the previous session's supervisor finish its last dispatch
        self.stop_supervisor().await;

        info!(broker = %self.broker_uri, client = %self.config.client_name, "Connecting");
        self.metrics.record_connection_attempt();

        let link = match self.open_with_timeout().await {
            Ok(link) => link,
            Err(cause) => {
                self.record_cause(&cause);
                return match self.transition(ConnectionState::Failed) {
                    Ok(_) => Err(ConnectError::from_transport(
                        &cause,
                        self.config.connect_timeout,
                    )),
                    Err(_) => Err(ConnectError::Aborted),
                };
            }
        };

        if self.transition(ConnectionState::Connected).is_err() {
            self.transport.abort().await;
            return Err(ConnectError::Aborted);
        }
        self.session_restored();
        self.sessions.session_established().await;

        if !self.install_supervisor(link) {
            self.transport.abort().await;
            return Err(ConnectError::Aborted);
        }
        Ok(())
    }

    /// Start supervising `link` unless a forced disconnect got in first
    ///
    /// The machine lock is held throughout, so a concurrent forced
    /// disconnect either lands before the check or finds the supervisor.
    fn install_supervisor(self: &Arc<Self>, link: TransportLink) -> bool {
        let machine = self.machine();
        if machine.state != ConnectionState::Connected {
            return false;
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let span = crate::service_span!(
            broker = %self.broker_uri,
            client = %self.config.client_name
        );
        let handle = tokio::spawn(supervise(self.clone(), link, shutdown_rx).instrument(span));
        *self.supervisor.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Supervisor { shutdown, handle });
        drop(machine);
        true
    }

    async fn disconnect(&self) -> ClientResult<()> {
        let _guard = self.disconnect_lock.lock().await;

        match self.state() {
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                debug!("Already disconnected");
                return Ok(());
            }
            ConnectionState::Failed => {
                self.stop_supervisor().await;
                let _ = self.transition(ConnectionState::Disconnected);
                return Ok(());
            }
            ConnectionState::Connecting => {
                // The pending connect call sees the refusal and reports Aborted
                if self.transition(ConnectionState::Disconnected).is_ok() {
                    self.transport.abort().await;
                }
                return Ok(());
            }
            ConnectionState::Connected | ConnectionState::Reconnecting => {}
        }

        if self.transition(ConnectionState::Disconnecting).is_err() {
            return Ok(());
        }

        self.stop_supervisor().await;
        if let Err(e) = self.transport.close().await {
            warn!(broker = %self.broker_uri, error = %e, "Graceful close failed");
        }
        let _ = self.transition(ConnectionState::Disconnected);
        Ok(())
    }

    async fn disconnect_force(&self) {
        match self.transition(ConnectionState::Disconnected) {
            Ok(from) => info!(broker = %self.broker_uri, from = %from, "Forced disconnect"),
            Err(_) => debug!("Forced disconnect while already disconnected"),
        }

        if let Some(supervisor) = self.take_supervisor() {
            let _ = supervisor.shutdown.send(true);
            supervisor.handle.abort();
        }
        self.transport.abort().await;
    }

    async fn stop_supervisor(&self) {
        let Some(supervisor) = self.take_supervisor() else {
            return;
        };
        let _ = supervisor.shutdown.send(true);

        let mut handle = supervisor.handle;
        if tokio::time::timeout(SUPERVISOR_JOIN_TIMEOUT, &mut handle)
            .await
            .is_err()
        {
            warn!("Supervisor did not stop in time, aborting");
            handle.abort();
        }
    }

    async fn fire(
        &self,
        role: ListenerRole,
        cause: Option<TransportError>,
        message: String,
        attempt: u32,
    ) {
        let event = ServiceEvent::new(self.broker_uri.clone(), cause, message, attempt);
        self.events.publish(role, event).await;
    }

    async fn interrupt(&self, cause: TransportError, message: String, attempt: u32) {
        if self.transition(ConnectionState::Failed).is_ok() {
            self.metrics.record_service_interruption();
            self.fire(ListenerRole::ServiceInterruption, Some(cause), message, attempt)
                .await;
        }
    }

    /// Run one reconnection episode; `Some` carries the new session's link
    async fn reconnect(
        &self,
        cause: TransportError,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<TransportLink> {
        self.record_cause(&cause);
        let strategy = self.config.retry_strategy;

        if !strategy.next(1).proceed {
            self.interrupt(
                cause.clone(),
                format!("Connection lost and reconnection is disabled: {cause}"),
                0,
            )
            .await;
            return None;
        }

        if self.transition(ConnectionState::Reconnecting).is_err() {
            return None;
        }

        let mut attempt = 1u32;
        let mut last_cause = cause;
        loop {
            let decision = strategy.next(attempt);
            if !decision.proceed {
                let made = attempt - 1;
                self.interrupt(
                    last_cause.clone(),
                    format!("Reconnection failed after {made} attempts: {last_cause}"),
                    made,
                )
                .await;
                return None;
            }

            tokio::select! {
                _ = shutdown.changed() => return None,
                _ = tokio::time::sleep(decision.wait) => {}
            }

            self.set_attempt(attempt);
            self.metrics.record_connection_attempt();
            debug!(attempt, "Reconnection attempt");

            let opened = tokio::select! {
                _ = shutdown.changed() => return None,
                opened = self.open_with_timeout() => opened,
            };

            match opened {
                Ok(link) => {
                    if self.transition(ConnectionState::Connected).is_err() {
                        self.transport.abort().await;
                        return None;
                    }
                    self.session_restored();
                    self.metrics.record_reconnection();
                    self.sessions.session_established().await;
                    self.fire(
                        ListenerRole::Reconnection,
                        None,
                        format!("Reconnected after {attempt} attempts"),
                        attempt,
                    )
                    .await;
                    return Some(link);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Reconnection attempt failed");
                    self.metrics.record_reconnection_attempt();
                    self.record_cause(&e);
                    self.fire(
                        ListenerRole::ReconnectionAttempt,
                        Some(e.clone()),
                        format!("Reconnection attempt {attempt} failed: {e}"),
                        attempt,
                    )
                    .await;
                    last_cause = e;
                    attempt += 1;
                }
            }
        }
    }
}

/// Read the live session until shutdown, reconnecting when it drops
async fn supervise(
    inner: Arc<Inner>,
    mut link: TransportLink,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = link.recv() => event,
        };

        match event {
            LinkEvent::Inbound(message) => {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = inner.sessions.dispatch(&message) => {}
                }
            }
            LinkEvent::Dropped(cause) => {
                if *shutdown.borrow() {
                    break;
                }
                warn!(broker = %inner.broker_uri, cause = %cause, "Session dropped");
                match inner.reconnect(cause, &mut shutdown).await {
                    Some(next) => link = next,
                    None => break,
                }
            }
        }
    }
    debug!("Supervisor stopped");
}
