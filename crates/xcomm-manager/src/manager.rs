//! Endpoint registry, handler map and message routing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use xcomm_transport::{
    now_ms, CommError, CommunicationMetrics, ConnectionHandler, Connector, CrossSystemMessage,
    HandlerFactory, HealthProber, Listeners, MessageSender, ProtocolHandlerFactory,
    SystemEndpoint,
};

use crate::config::ManagerConfig;
use crate::status::{ManagerStatus, SystemStateChange, SystemStatus};
use crate::{health, processor};

pub(crate) type MessageListener = dyn Fn(&CrossSystemMessage) + Send + Sync;
pub(crate) type ErrorListener = dyn Fn(&str, &CommError) + Send + Sync;
pub(crate) type StateListener = dyn Fn(&str, SystemStateChange) + Send + Sync;

type Handlers = HashMap<String, Arc<dyn ConnectionHandler>>;
type SystemLock = Arc<tokio::sync::Mutex<()>>;

/// Single entry point for endpoint lifecycle, routing and observability.
///
/// Cheap to clone; every clone drives the same manager. Background loops run
/// between [`start`](Self::start) and [`stop`](Self::stop).
#[derive(Clone)]
pub struct CommunicationManager {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: ManagerConfig,
    factory: Arc<dyn HandlerFactory>,
    pub(crate) endpoints: RwLock<HashMap<String, SystemEndpoint>>,
    handlers: RwLock<Handlers>,
    /// Counters of handlers that have been torn down.
    retired: Mutex<CommunicationMetrics>,
    message_listeners: Arc<Listeners<MessageListener>>,
    error_listeners: Listeners<ErrorListener>,
    state_listeners: Listeners<StateListener>,
    inbound_tx: mpsc::Sender<CrossSystemMessage>,
    /// Parked here while the processor is not running.
    inbound_rx: Mutex<Option<mpsc::Receiver<CrossSystemMessage>>>,
    background: Mutex<Option<Background>>,
    /// One lock per system id: connect, disconnect and remove of the same
    /// system are serialised, different systems never wait on each other.
    lifecycle: Mutex<HashMap<String, SystemLock>>,
    pub(crate) prober: HealthProber,
}

struct Background {
    cancel: CancellationToken,
    processor: JoinHandle<mpsc::Receiver<CrossSystemMessage>>,
    health: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(background) = lock(&self.background).take() {
            background.cancel.cancel();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

impl Default for CommunicationManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl CommunicationManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_factory(config, Arc::new(ProtocolHandlerFactory))
    }

    /// Use `factory` instead of the protocol-based one to build handlers.
    pub fn with_factory(config: ManagerConfig, factory: Arc<dyn HandlerFactory>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                endpoints: RwLock::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                retired: Mutex::new(CommunicationMetrics::default()),
                message_listeners: Arc::new(Listeners::new()),
                error_listeners: Listeners::new(),
                state_listeners: Listeners::new(),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                background: Mutex::new(None),
                lifecycle: Mutex::new(HashMap::new()),
                prober: HealthProber::new(),
            }),
        }
    }

    // ── Registry ────────────────────────────────────────────────────

    /// Register an endpoint. Fails if the id is already taken.
    pub fn add_endpoint(&self, endpoint: SystemEndpoint) -> bool {
        let mut endpoints = write(&self.inner.endpoints);
        if endpoints.contains_key(&endpoint.system_id) {
            tracing::warn!("{}", CommError::DuplicateSystem(endpoint.system_id));
            return false;
        }
        tracing::info!(
            "registered {} ({} {})",
            endpoint.system_id,
            endpoint.protocol,
            endpoint.socket_addr()
        );
        endpoints.insert(endpoint.system_id.clone(), endpoint);
        true
    }

    /// Unregister an endpoint, disconnecting its handler first. Waits for
    /// an in-flight connect of the same system to finish.
    pub async fn remove_endpoint(&self, system_id: &str) -> bool {
        let gate = self.lifecycle_lock(system_id);
        let _lifecycle = gate.lock().await;

        if !read(&self.inner.endpoints).contains_key(system_id) {
            tracing::debug!("{}", CommError::UnknownSystem(system_id.to_string()));
            return false;
        }
        if self.handler(system_id).is_some() && !self.disconnect_locked(system_id).await {
            return false;
        }
        self.inner.prober.forget(system_id);
        write(&self.inner.endpoints).remove(system_id).is_some()
    }

    pub fn endpoint(&self, system_id: &str) -> Option<SystemEndpoint> {
        read(&self.inner.endpoints).get(system_id).cloned()
    }

    pub(crate) fn handler(&self, system_id: &str) -> Option<Arc<dyn ConnectionHandler>> {
        read(&self.inner.handlers).get(system_id).cloned()
    }

    /// Ids of systems whose handler is currently connected, sorted.
    pub fn connected_systems(&self) -> Vec<String> {
        let mut ids: Vec<String> = read(&self.inner.handlers)
            .iter()
            .filter(|(_, h)| h.is_connected())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    // ── Connection lifecycle ────────────────────────────────────────

    fn lifecycle_lock(&self, system_id: &str) -> SystemLock {
        lock(&self.inner.lifecycle)
            .entry(system_id.to_string())
            .or_default()
            .clone()
    }

    /// Build the endpoint's handler and connect it.
    pub async fn connect_system(&self, system_id: &str) -> bool {
        match self.try_connect(system_id).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("connect {system_id}: {e}");
                false
            }
        }
    }

    async fn try_connect(&self, system_id: &str) -> Result<(), CommError> {
        let gate = self.lifecycle_lock(system_id);
        let _lifecycle = gate.lock().await;

        if let Some(existing) = self.handler(system_id) {
            if existing.is_connected() {
                return Ok(());
            }
            // Connection was lost; drop the dead handler before replacing it.
            self.teardown(system_id, existing).await?;
        }

        let endpoint = self
            .endpoint(system_id)
            .ok_or_else(|| CommError::UnknownSystem(system_id.to_string()))?;
        let handler = self
            .inner
            .factory
            .create(&endpoint, &self.inner.config.handler_options)?;
        self.wire(&handler);

        if let Err(e) = handler.connect().await {
            self.retire(&handler);
            self.notify_state(system_id, SystemStateChange::ConnectFailed);
            return Err(e);
        }

        write(&self.inner.handlers).insert(system_id.to_string(), handler);
        tracing::info!("connected {system_id}");
        self.notify_state(system_id, SystemStateChange::Connected);
        Ok(())
    }

    /// Disconnect and drop the system's handler.
    pub async fn disconnect_system(&self, system_id: &str) -> bool {
        let gate = self.lifecycle_lock(system_id);
        let _lifecycle = gate.lock().await;
        self.disconnect_locked(system_id).await
    }

    /// Caller holds the system's lifecycle lock.
    async fn disconnect_locked(&self, system_id: &str) -> bool {
        let Some(handler) = self.handler(system_id) else {
            tracing::debug!("disconnect {system_id}: no handler");
            return false;
        };
        match self.teardown(system_id, handler).await {
            Ok(()) => {
                tracing::info!("disconnected {system_id}");
                self.notify_state(system_id, SystemStateChange::Disconnected);
                true
            }
            Err(e) => {
                tracing::warn!("disconnect {system_id}: {e}");
                false
            }
        }
    }

    /// Disconnect, then forget the handler and keep its counters.
    async fn teardown(
        &self,
        system_id: &str,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<(), CommError> {
        handler.disconnect().await?;
        write(&self.inner.handlers).remove(system_id);
        self.retire(&handler);
        Ok(())
    }

    fn retire(&self, handler: &Arc<dyn ConnectionHandler>) {
        let mut last = handler.metrics();
        last.active_connections = 0;
        lock(&self.inner.retired).merge(&last);
    }

    /// Route handler callbacks into the manager: messages into the bounded
    /// inbound queue, errors to the manager's error listeners.
    fn wire(&self, handler: &Arc<dyn ConnectionHandler>) {
        let system_id = handler.system_id().to_string();

        let tx = self.inner.inbound_tx.clone();
        let from = system_id.clone();
        handler.on_message(Arc::new(move |msg: &CrossSystemMessage| {
            if let Err(e) = tx.try_send(msg.clone()) {
                tracing::warn!("inbound queue: dropping {} from {from}: {e}", msg.message_id);
            }
        }));

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        handler.on_error(Arc::new(move |err: &CommError| {
            if let Some(inner) = weak.upgrade() {
                inner
                    .error_listeners
                    .notify_with("error", |cb| cb(system_id.as_str(), err));
            }
        }));
    }

    // ── Routing ─────────────────────────────────────────────────────

    /// Send to `msg.target_system`. Fails closed: unknown, disconnected or
    /// expired targets return `false` without touching any handler.
    pub async fn send_message(&self, msg: &CrossSystemMessage) -> bool {
        match self.try_send(msg).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("send {} to {}: {e}", msg.message_id, msg.target_system);
                false
            }
        }
    }

    async fn try_send(&self, msg: &CrossSystemMessage) -> Result<(), CommError> {
        if msg.is_expired(now_ms()) {
            return Err(CommError::Expired(msg.message_id.clone()));
        }
        let handler = self
            .handler(&msg.target_system)
            .filter(|h| h.is_connected())
            .ok_or_else(|| CommError::NotConnected(msg.target_system.clone()))?;
        handler.send_message(msg).await
    }

    /// Send, retrying transport failures immediately up to
    /// `min(msg.max_retries, endpoint.retry_attempts)` more times.
    ///
    /// `msg.retry_count` is bumped once per retry.
    pub async fn send_with_retry(&self, msg: &mut CrossSystemMessage) -> bool {
        let budget = self
            .endpoint(&msg.target_system)
            .map(|ep| ep.retry_attempts.min(msg.max_retries))
            .unwrap_or(0);
        let mut retries = 0;
        loop {
            let err = match self.try_send(msg).await {
                Ok(()) => return true,
                Err(e) => e,
            };
            let transient = matches!(err, CommError::Send { .. } | CommError::HttpStatus { .. });
            if !transient || retries >= budget {
                tracing::debug!("send {} to {}: giving up: {err}", msg.message_id, msg.target_system);
                return false;
            }
            match msg.record_retry() {
                Ok(attempt) => {
                    retries += 1;
                    tracing::debug!("send {}: retry {attempt} after {err}", msg.message_id);
                }
                Err(e) => {
                    tracing::debug!("{e}");
                    return false;
                }
            }
        }
    }

    /// Send a copy of `msg` to every connected system not in `exclude`,
    /// concurrently. Each copy's `target_system` is the recipient.
    pub async fn broadcast_message(
        &self,
        msg: &CrossSystemMessage,
        exclude: &[&str],
    ) -> HashMap<String, bool> {
        let targets: Vec<(String, Arc<dyn ConnectionHandler>)> = read(&self.inner.handlers)
            .iter()
            .filter(|(id, h)| !exclude.contains(&id.as_str()) && h.is_connected())
            .map(|(id, h)| (id.clone(), h.clone()))
            .collect();

        if msg.is_expired(now_ms()) {
            tracing::debug!("broadcast {}: expired", msg.message_id);
            return targets.into_iter().map(|(id, _)| (id, false)).collect();
        }

        let sends = targets.into_iter().map(|(id, handler)| {
            let mut copy = msg.clone();
            copy.target_system = id.clone();
            async move {
                let delivered = match handler.send_message(&copy).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::debug!("broadcast {} to {id}: {e}", copy.message_id);
                        false
                    }
                };
                (id, delivered)
            }
        });
        join_all(sends).await.into_iter().collect()
    }

    // ── Background loops ────────────────────────────────────────────

    /// Start the message processor and the health-check loop. No-op if
    /// already running.
    pub fn start(&self) {
        let mut background = lock(&self.inner.background);
        if background.is_some() {
            return;
        }
        let Some(rx) = lock(&self.inner.inbound_rx).take() else {
            tracing::error!("inbound queue receiver missing; not starting");
            return;
        };

        let cancel = CancellationToken::new();
        let processor = tokio::spawn(processor::run(
            rx,
            self.inner.message_listeners.clone(),
            cancel.clone(),
        ));
        let health = tokio::spawn(health::run(
            Arc::downgrade(&self.inner),
            self.inner.config.health_check_tick,
            cancel.clone(),
        ));
        *background = Some(Background {
            cancel,
            processor,
            health,
        });
        tracing::info!("communication manager started");
    }

    /// Stop both loops, waiting for them, then disconnect every handler.
    pub async fn stop(&self) {
        let background = lock(&self.inner.background).take();
        if let Some(background) = background {
            background.cancel.cancel();
            match background.processor.await {
                Ok(rx) => *lock(&self.inner.inbound_rx) = Some(rx),
                Err(e) => tracing::error!("message processor ended abnormally: {e}"),
            }
            if let Err(e) = background.health.await {
                tracing::error!("health loop ended abnormally: {e}");
            }
        }

        let ids: Vec<String> = read(&self.inner.handlers).keys().cloned().collect();
        for id in ids {
            self.disconnect_system(&id).await;
        }
        tracing::info!("communication manager stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.background).is_some()
    }

    // ── Listeners ───────────────────────────────────────────────────

    /// Called by the processor for every inbound message, in queue order.
    pub fn on_message(&self, callback: impl Fn(&CrossSystemMessage) + Send + Sync + 'static) {
        self.inner.message_listeners.add(Arc::new(callback));
    }

    /// Called with the system id for every handler-reported error.
    pub fn on_error(&self, callback: impl Fn(&str, &CommError) + Send + Sync + 'static) {
        self.inner.error_listeners.add(Arc::new(callback));
    }

    /// Called on connect, disconnect, failed connect and health flips.
    pub fn on_state_change(&self, callback: impl Fn(&str, SystemStateChange) + Send + Sync + 'static) {
        self.inner.state_listeners.add(Arc::new(callback));
    }

    pub(crate) fn notify_state(&self, system_id: &str, change: SystemStateChange) {
        self.inner
            .state_listeners
            .notify_with("state", |cb| cb(system_id, change));
    }

    // ── Snapshots ───────────────────────────────────────────────────

    /// System-wide counters: live handlers plus everything retired.
    pub fn get_metrics(&self) -> CommunicationMetrics {
        let mut total = lock(&self.inner.retired).clone();
        for handler in read(&self.inner.handlers).values() {
            total.merge(&handler.metrics());
        }
        total
    }

    pub fn get_endpoint_status(&self, system_id: &str) -> Option<SystemStatus> {
        let endpoint = self.endpoint(system_id)?;
        let handler = self.handler(system_id);
        Some(SystemStatus::new(
            &endpoint,
            handler.as_ref().is_some_and(|h| h.is_connected()),
            handler.map(|h| h.metrics()),
        ))
    }

    pub fn get_system_status(&self) -> ManagerStatus {
        let endpoints: Vec<SystemEndpoint> =
            read(&self.inner.endpoints).values().cloned().collect();
        let mut systems: Vec<SystemStatus> = endpoints
            .iter()
            .map(|ep| {
                let handler = self.handler(&ep.system_id);
                SystemStatus::new(
                    ep,
                    handler.as_ref().is_some_and(|h| h.is_connected()),
                    handler.map(|h| h.metrics()),
                )
            })
            .collect();
        systems.sort_by(|a, b| a.system_id.cmp(&b.system_id));

        ManagerStatus {
            running: self.is_running(),
            total_endpoints: systems.len(),
            connected_systems: systems.iter().filter(|s| s.is_connected).count(),
            healthy_systems: systems.iter().filter(|s| s.is_healthy).count(),
            systems,
        }
    }
}
