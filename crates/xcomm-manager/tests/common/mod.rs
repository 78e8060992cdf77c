//! In-process handler double injected through the factory seam.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use xcomm_manager::{CommunicationManager, ManagerConfig};
use xcomm_metrics::HandlerMetrics;
use xcomm_transport::{
    CommError, CommunicationMetrics, ConnectionHandler, ConnectionState, Connector,
    CrossSystemMessage, ErrorCallback, HandlerCallbacks, HandlerFactory, HandlerOptions,
    MessageCallback, MessageReceiver, MessageSender, SystemEndpoint,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

/// How the next handler built for a system behaves.
#[derive(Debug, Clone, Copy, Default)]
pub struct Behavior {
    pub fail_connect: bool,
    /// Number of sends that fail before sends start succeeding.
    pub failing_sends: u32,
    /// Connect takes this long before succeeding or failing.
    pub connect_delay: Option<Duration>,
    /// Every send stalls until [`SEND_STALL`] expires, then fails.
    pub hang_send: bool,
}

/// How long a `hang_send` handler sits on a send before giving up.
pub const SEND_STALL: Duration = Duration::from_millis(500);

pub struct MockHandler {
    endpoint: SystemEndpoint,
    behavior: Behavior,
    state: Mutex<ConnectionState>,
    failing_sends: AtomicU32,
    pub sent: Mutex<Vec<CrossSystemMessage>>,
    metrics: HandlerMetrics,
    callbacks: HandlerCallbacks,
}

impl MockHandler {
    fn new(endpoint: SystemEndpoint, behavior: Behavior) -> Self {
        Self {
            endpoint,
            behavior,
            state: Mutex::new(ConnectionState::Disconnected),
            failing_sends: AtomicU32::new(behavior.failing_sends),
            sent: Mutex::new(Vec::new()),
            metrics: HandlerMetrics::new(),
            callbacks: HandlerCallbacks::default(),
        }
    }

    /// Pretend the receive loop read `msg` off the wire.
    pub fn inject(&self, msg: CrossSystemMessage) {
        self.metrics.record_received();
        self.callbacks.notify_message(&msg);
    }

    /// Pretend the peer went away. Like the real handlers, loss is silent.
    pub fn drop_connection(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == ConnectionState::Connected {
            self.metrics.connection_closed();
        }
        *state = ConnectionState::Error;
    }

    pub fn sent_ids(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.message_id.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl Connector for MockHandler {
    async fn connect(&self) -> Result<(), CommError> {
        if let Some(delay) = self.behavior.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.behavior.fail_connect {
            *self.state.lock().unwrap() = ConnectionState::Error;
            self.metrics.record_failure();
            let err = CommError::ConnectionClosed(self.endpoint.system_id.clone());
            self.callbacks.notify_error(&err);
            return Err(err);
        }
        *self.state.lock().unwrap() = ConnectionState::Connected;
        self.metrics.connection_opened();
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CommError> {
        let mut state = self.state.lock().unwrap();
        if *state == ConnectionState::Connected {
            self.metrics.connection_closed();
        }
        *state = ConnectionState::Disconnected;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl MessageSender for MockHandler {
    async fn send_message(&self, message: &CrossSystemMessage) -> Result<(), CommError> {
        if !self.is_connected() {
            return Err(CommError::NotConnected(self.endpoint.system_id.clone()));
        }
        if self.behavior.hang_send {
            let _ = tokio::time::timeout(SEND_STALL, std::future::pending::<()>()).await;
            self.metrics.record_failure();
            let err = CommError::HttpStatus {
                system_id: self.endpoint.system_id.clone(),
                status: 504,
            };
            self.callbacks.notify_error(&err);
            return Err(err);
        }
        let failing = self
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.metrics.record_failure();
            let err = CommError::HttpStatus {
                system_id: self.endpoint.system_id.clone(),
                status: 503,
            };
            self.callbacks.notify_error(&err);
            return Err(err);
        }
        self.metrics.record_sent();
        self.metrics.record_success();
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageReceiver for MockHandler {
    async fn receive_message(&self) -> Result<Option<CrossSystemMessage>, CommError> {
        Ok(None)
    }
}

impl ConnectionHandler for MockHandler {
    fn endpoint(&self) -> &SystemEndpoint {
        &self.endpoint
    }

    fn metrics(&self) -> CommunicationMetrics {
        self.metrics.snapshot()
    }

    fn on_message(&self, callback: MessageCallback) {
        self.callbacks.messages.add(callback);
    }

    fn on_error(&self, callback: ErrorCallback) {
        self.callbacks.errors.add(callback);
    }
}

/// Builds [`MockHandler`]s and remembers the latest one per system.
#[derive(Default)]
pub struct MockFactory {
    behaviors: Mutex<HashMap<String, Behavior>>,
    built: Mutex<HashMap<String, Arc<MockHandler>>>,
}

impl MockFactory {
    pub fn set(&self, system_id: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(system_id.to_string(), behavior);
    }

    pub fn handler(&self, system_id: &str) -> Arc<MockHandler> {
        self.built.lock().unwrap()[system_id].clone()
    }

    pub fn built_count(&self) -> usize {
        self.built.lock().unwrap().len()
    }
}

impl HandlerFactory for MockFactory {
    fn create(
        &self,
        endpoint: &SystemEndpoint,
        _options: &HandlerOptions,
    ) -> Result<Arc<dyn ConnectionHandler>, CommError> {
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&endpoint.system_id)
            .copied()
            .unwrap_or_default();
        let handler = Arc::new(MockHandler::new(endpoint.clone(), behavior));
        self.built
            .lock()
            .unwrap()
            .insert(endpoint.system_id.clone(), handler.clone());
        Ok(handler)
    }
}

pub fn mock_manager(config: ManagerConfig) -> (CommunicationManager, Arc<MockFactory>) {
    let factory = Arc::new(MockFactory::default());
    let manager = CommunicationManager::with_factory(config, factory.clone());
    (manager, factory)
}
