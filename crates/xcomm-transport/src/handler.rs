//! Handler capability traits and the state every handler carries.
//!
//! A handler is the live connection object for one endpoint. Its
//! capabilities are split into [`Connector`], [`MessageSender`] and
//! [`MessageReceiver`]; [`ConnectionHandler`] bundles them with identity,
//! metrics and listener registration so the manager can hold
//! `Arc<dyn ConnectionHandler>`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use xcomm_metrics::{CommunicationMetrics, HandlerMetrics};

use crate::callbacks::{ErrorCallback, HandlerCallbacks, MessageCallback};
use crate::config::HandlerOptions;
use crate::endpoint::{Protocol, SystemEndpoint};
use crate::http::HttpHandler;
use crate::message::CrossSystemMessage;
use crate::tcp::TcpHandler;
use crate::websocket::WebSocketHandler;
use crate::CommError;

/// Lifecycle: `Disconnected → Connecting → Connected → {Disconnected | Error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Opens and releases the underlying transport.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Open the transport. No retry happens here; on failure the error
    /// listeners fire and the error is returned.
    async fn connect(&self) -> Result<(), CommError>;

    /// Stop the receive loop (awaiting it) and release the transport.
    async fn disconnect(&self) -> Result<(), CommError>;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

/// Writes envelopes in the protocol's wire format.
#[async_trait::async_trait]
pub trait MessageSender: Send + Sync {
    /// Fails with [`CommError::NotConnected`] without touching metrics when
    /// the handler is not connected.
    async fn send_message(&self, message: &CrossSystemMessage) -> Result<(), CommError>;
}

/// Yields inbound envelopes.
#[async_trait::async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Wait for the next inbound envelope. Request/response transports have
    /// no independent receive and return `Ok(None)`.
    async fn receive_message(&self) -> Result<Option<CrossSystemMessage>, CommError>;
}

/// A live, protocol-specific connection for one endpoint.
pub trait ConnectionHandler: Connector + MessageSender + MessageReceiver {
    fn endpoint(&self) -> &SystemEndpoint;

    fn system_id(&self) -> &str {
        &self.endpoint().system_id
    }

    fn protocol(&self) -> Protocol {
        self.endpoint().protocol
    }

    fn metrics(&self) -> CommunicationMetrics;

    fn on_message(&self, callback: MessageCallback);

    fn on_error(&self, callback: ErrorCallback);
}

/// Builds the handler matching an endpoint.
pub trait HandlerFactory: Send + Sync {
    fn create(
        &self,
        endpoint: &SystemEndpoint,
        options: &HandlerOptions,
    ) -> Result<Arc<dyn ConnectionHandler>, CommError>;
}

/// HTTP/HTTPS, WebSocket and TCP; UDP is rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolHandlerFactory;

impl HandlerFactory for ProtocolHandlerFactory {
    fn create(
        &self,
        endpoint: &SystemEndpoint,
        options: &HandlerOptions,
    ) -> Result<Arc<dyn ConnectionHandler>, CommError> {
        create_handler(endpoint, options)
    }
}

/// Construct the handler for `endpoint.protocol`.
pub fn create_handler(
    endpoint: &SystemEndpoint,
    options: &HandlerOptions,
) -> Result<Arc<dyn ConnectionHandler>, CommError> {
    let handler: Arc<dyn ConnectionHandler> = match endpoint.protocol {
        Protocol::Http | Protocol::Https => {
            Arc::new(HttpHandler::new(endpoint.clone(), options.clone()))
        }
        Protocol::WebSocket => Arc::new(WebSocketHandler::new(endpoint.clone(), options.clone())),
        Protocol::Tcp => Arc::new(TcpHandler::new(endpoint.clone(), options.clone())),
        other => return Err(CommError::UnsupportedProtocol(other)),
    };
    Ok(handler)
}

/// State shared between a handler and its receive loop.
pub(crate) struct HandlerCore {
    pub endpoint: SystemEndpoint,
    pub options: HandlerOptions,
    pub metrics: HandlerMetrics,
    pub callbacks: HandlerCallbacks,
    state: watch::Sender<ConnectionState>,
    /// Whether this handler currently holds one `active_connections` slot.
    counted: AtomicBool,
    inbound: broadcast::Sender<CrossSystemMessage>,
}

impl HandlerCore {
    pub fn new(endpoint: SystemEndpoint, options: HandlerOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (inbound, _) = broadcast::channel(options.inbound_buffer);
        Self {
            endpoint,
            options,
            metrics: HandlerMetrics::new(),
            callbacks: HandlerCallbacks::default(),
            state,
            counted: AtomicBool::new(false),
            inbound,
        }
    }

    pub fn system_id(&self) -> &str {
        &self.endpoint.system_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn set_connecting(&self) {
        self.state.send_replace(ConnectionState::Connecting);
    }

    /// Transport is open: take an `active_connections` slot.
    pub fn opened(&self) {
        if !self.counted.swap(true, Ordering::SeqCst) {
            self.metrics.connection_opened();
        }
        self.state.send_replace(ConnectionState::Connected);
    }

    /// Transport is gone: give the slot back exactly once.
    pub fn released(&self, state: ConnectionState) {
        if self.counted.swap(false, Ordering::SeqCst) {
            self.metrics.connection_closed();
        }
        self.state.send_replace(state);
    }

    /// Record a transport failure and tell the error listeners.
    pub fn fail(&self, error: CommError) -> CommError {
        tracing::warn!("{}: {error}", self.endpoint.system_id);
        self.metrics.record_failure();
        self.callbacks.notify_error(&error);
        error
    }

    /// Deliver an inbound envelope to waiting receivers and listeners, in
    /// arrival order.
    pub fn dispatch(&self, message: CrossSystemMessage) {
        self.metrics.record_received();
        tracing::debug!(
            "{}: received {} {}",
            self.endpoint.system_id,
            message.message_type,
            message.message_id
        );
        // No receiver waiting is fine.
        let _ = self.inbound.send(message.clone());
        self.callbacks.notify_message(&message);
    }

    pub fn ensure_connected(&self) -> Result<(), CommError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(CommError::NotConnected(self.endpoint.system_id.clone()))
        }
    }

    /// Next envelope dispatched after this call, or connection loss.
    pub async fn next_inbound(&self) -> Result<Option<CrossSystemMessage>, CommError> {
        let mut inbound = self.inbound.subscribe();
        let mut state = self.state.subscribe();
        self.ensure_connected()?;

        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Ok(message) => return Ok(Some(message)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "{}: receiver lagged, {skipped} messages skipped",
                            self.endpoint.system_id
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(CommError::ConnectionClosed(self.system_id().to_string()));
                    }
                },
                _ = state.wait_for(|s| *s != ConnectionState::Connected) => {
                    return Err(CommError::ConnectionClosed(self.system_id().to_string()));
                }
            }
        }
    }

    pub fn add_message_listener(&self, callback: MessageCallback) {
        self.callbacks.messages.add(callback);
    }

    pub fn add_error_listener(&self, callback: ErrorCallback) {
        self.callbacks.errors.add(callback);
    }
}

/// The background read task of a streaming handler. Dropping it cancels
/// the task, which releases the socket halves it owns.
#[derive(Default)]
pub(crate) struct ReceiveLoop {
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Drop for ReceiveLoop {
    fn drop(&mut self) {
        let running = self.running.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some((cancel, _)) = running.take() {
            cancel.cancel();
        }
    }
}

impl ReceiveLoop {
    /// Spawn `run` with a fresh cancellation token.
    pub fn start<F, Fut>(&self, run: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(cancel.clone()));
        let previous = self
            .running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace((cancel, handle));
        if let Some((cancel, _)) = previous {
            cancel.cancel();
        }
    }

    /// Cancel the task and wait for it to finish.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!("receive loop panicked: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    fn core() -> Arc<HandlerCore> {
        let ep = SystemEndpoint::new("svc", "Svc", Protocol::Tcp, "localhost", 1);
        Arc::new(HandlerCore::new(ep, HandlerOptions::new()))
    }

    #[test]
    fn factory_rejects_udp() {
        let ep = SystemEndpoint::new("u", "U", Protocol::Udp, "localhost", 1);
        let err = ProtocolHandlerFactory
            .create(&ep, &HandlerOptions::new())
            .err()
            .unwrap();
        assert!(matches!(err, CommError::UnsupportedProtocol(Protocol::Udp)));
    }

    #[test]
    fn factory_matches_protocol() {
        for protocol in [Protocol::Http, Protocol::Https, Protocol::WebSocket, Protocol::Tcp] {
            let ep = SystemEndpoint::new("x", "X", protocol, "localhost", 1);
            let handler = create_handler(&ep, &HandlerOptions::new()).unwrap();
            assert_eq!(handler.protocol(), protocol);
            assert_eq!(handler.state(), ConnectionState::Disconnected);
            assert_eq!(handler.metrics().active_connections, 0);
        }
    }

    #[test]
    fn release_gives_slot_back_once() {
        let core = core();
        core.opened();
        core.opened();
        assert_eq!(core.metrics.active_connections(), 1);
        core.released(ConnectionState::Error);
        core.released(ConnectionState::Disconnected);
        assert_eq!(core.metrics.active_connections(), 0);
        assert_eq!(core.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn next_inbound_requires_connection() {
        let core = core();
        assert!(matches!(
            core.next_inbound().await,
            Err(CommError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn next_inbound_sees_dispatch_and_loss() {
        let core = core();
        core.opened();

        let waiter = tokio::spawn({
            let core = core.clone();
            async move { core.next_inbound().await }
        });
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        core.dispatch(CrossSystemMessage::new("m", "a", "svc", MessageType::Event));
        let got = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(got.message_id, "m");

        let waiter = tokio::spawn({
            let core = core.clone();
            async move { core.next_inbound().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        core.released(ConnectionState::Error);
        assert!(matches!(
            waiter.await.unwrap(),
            Err(CommError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn receive_loop_stop_waits_for_exit() {
        let exited = Arc::new(AtomicBool::new(false));
        let receive = ReceiveLoop::default();
        let flag = exited.clone();
        receive.start(move |cancel| async move {
            cancel.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });
        receive.stop().await;
        assert!(exited.load(Ordering::SeqCst));
        // Stopping twice is a no-op.
        receive.stop().await;
    }
}
