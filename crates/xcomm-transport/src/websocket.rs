//! WebSocket handler: one JSON envelope per text frame.

use std::sync::Arc;

use anyhow::anyhow;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use xcomm_metrics::CommunicationMetrics;

use crate::callbacks::{ErrorCallback, MessageCallback};
use crate::config::HandlerOptions;
use crate::endpoint::SystemEndpoint;
use crate::handler::{
    ConnectionHandler, ConnectionState, Connector, HandlerCore, MessageReceiver, MessageSender,
    ReceiveLoop,
};
use crate::message::CrossSystemMessage;
use crate::{tls, CommError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type SharedSink = Arc<Mutex<Option<WsSink>>>;

pub struct WebSocketHandler {
    core: Arc<HandlerCore>,
    sink: SharedSink,
    receive: ReceiveLoop,
}

impl WebSocketHandler {
    pub fn new(endpoint: SystemEndpoint, options: HandlerOptions) -> Self {
        Self {
            core: Arc::new(HandlerCore::new(endpoint, options)),
            sink: Arc::new(Mutex::new(None)),
            receive: ReceiveLoop::default(),
        }
    }

    fn connect_error(&self, source: anyhow::Error) -> CommError {
        CommError::Connect {
            system_id: self.core.system_id().to_string(),
            source,
        }
    }

    async fn open(&self) -> Result<WsStream, CommError> {
        let endpoint = &self.core.endpoint;
        let url = endpoint.url();
        let handshake = async {
            match &endpoint.tls {
                Some(options) => {
                    let connector =
                        tokio_tungstenite::Connector::Rustls(tls::client_config(options)?);
                    tokio_tungstenite::connect_async_tls_with_config(
                        url.as_str(),
                        None,
                        true,
                        Some(connector),
                    )
                    .await
                    .map_err(|e| self.connect_error(e.into()))
                }
                None => tokio_tungstenite::connect_async(url.as_str())
                    .await
                    .map_err(|e| self.connect_error(e.into())),
            }
        };
        let (stream, response) = tokio::time::timeout(endpoint.timeout, handshake)
            .await
            .map_err(|_| self.connect_error(anyhow!("handshake timed out after {:?}", endpoint.timeout)))??;
        tracing::debug!(
            "{}: websocket upgrade answered {}",
            endpoint.system_id,
            response.status()
        );
        Ok(stream)
    }
}

fn deliver(core: &HandlerCore, data: &[u8]) {
    match CrossSystemMessage::from_slice(data) {
        Ok(message) => core.dispatch(message),
        Err(e) => {
            core.fail(e);
        }
    }
}

/// Read frames until cancelled, closed by the peer, or broken.
async fn read_loop(
    core: Arc<HandlerCore>,
    mut stream: SplitStream<WsStream>,
    sink: SharedSink,
    cancel: CancellationToken,
) {
    let reason = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => deliver(&core, text.as_str().as_bytes()),
            Some(Ok(Message::Binary(data))) => deliver(&core, &data),
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!("{}: peer closed: {frame:?}", core.system_id());
                break None;
            }
            // Ping/pong are answered by tungstenite.
            Some(Ok(_)) => {}
            Some(Err(e)) => break Some(e),
            None => break None,
        }
    };

    // Loss is not an error report; the health check picks it up.
    sink.lock().await.take();
    core.released(ConnectionState::Error);
    match reason {
        Some(e) => tracing::info!("{}: websocket lost: {e}", core.system_id()),
        None => tracing::info!("{}: websocket closed by peer", core.system_id()),
    }
}

#[async_trait::async_trait]
impl Connector for WebSocketHandler {
    async fn connect(&self) -> Result<(), CommError> {
        if self.core.is_connected() {
            return Ok(());
        }
        self.receive.stop().await;

        self.core.set_connecting();
        let stream = match self.open().await {
            Ok(stream) => stream,
            Err(e) => {
                self.core.released(ConnectionState::Error);
                return Err(self.core.fail(e));
            }
        };

        let (sink, stream) = stream.split();
        *self.sink.lock().await = Some(sink);
        self.core.opened();
        let core = self.core.clone();
        let shared = self.sink.clone();
        self.receive
            .start(move |cancel| read_loop(core, stream, shared, cancel));
        tracing::info!(
            "{}: websocket connected to {}",
            self.core.system_id(),
            self.core.endpoint.url()
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CommError> {
        self.receive.stop().await;
        if let Some(mut sink) = self.sink.lock().await.take() {
            match tokio::time::timeout(self.core.endpoint.timeout, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!("{}: websocket close: {e}", self.core.system_id()),
                Err(_) => tracing::debug!("{}: websocket close timed out", self.core.system_id()),
            }
        }
        self.core.released(ConnectionState::Disconnected);
        tracing::info!("{}: websocket disconnected", self.core.system_id());
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.core.state()
    }
}

#[async_trait::async_trait]
impl MessageSender for WebSocketHandler {
    async fn send_message(&self, message: &CrossSystemMessage) -> Result<(), CommError> {
        self.core.ensure_connected()?;
        let json = message.to_json()?;
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| CommError::NotConnected(self.core.system_id().to_string()))?;

        let timeout = self.core.endpoint.timeout;
        let written = tokio::time::timeout(timeout, sink.send(Message::text(json))).await;
        let source = match written {
            Ok(Ok(())) => {
                self.core.metrics.record_sent();
                self.core.metrics.record_success();
                return Ok(());
            }
            Ok(Err(e)) => e.into(),
            Err(_) => {
                // A half-sent frame leaves the stream unusable.
                guard.take();
                self.core.released(ConnectionState::Error);
                anyhow!("write stalled for {timeout:?}")
            }
        };
        Err(self.core.fail(CommError::Send {
            system_id: self.core.system_id().to_string(),
            source,
        }))
    }
}

#[async_trait::async_trait]
impl MessageReceiver for WebSocketHandler {
    async fn receive_message(&self) -> Result<Option<CrossSystemMessage>, CommError> {
        self.core.next_inbound().await
    }
}

impl ConnectionHandler for WebSocketHandler {
    fn endpoint(&self) -> &SystemEndpoint {
        &self.core.endpoint
    }

    fn metrics(&self) -> CommunicationMetrics {
        self.core.metrics.snapshot()
    }

    fn on_message(&self, callback: MessageCallback) {
        self.core.add_message_listener(callback);
    }

    fn on_error(&self, callback: ErrorCallback) {
        self.core.add_error_listener(callback);
    }
}
