//! Raw TCP handler: one length-prefixed JSON envelope per frame, with
//! optional TLS.

use std::sync::Arc;

use anyhow::anyhow;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
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
use crate::{framing, tls, CommError};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedWriter = Arc<Mutex<Option<BoxWriter>>>;

pub struct TcpHandler {
    core: Arc<HandlerCore>,
    writer: SharedWriter,
    receive: ReceiveLoop,
}

impl TcpHandler {
    pub fn new(endpoint: SystemEndpoint, options: HandlerOptions) -> Self {
        Self {
            core: Arc::new(HandlerCore::new(endpoint, options)),
            writer: Arc::new(Mutex::new(None)),
            receive: ReceiveLoop::default(),
        }
    }

    fn connect_error(&self, source: anyhow::Error) -> CommError {
        CommError::Connect {
            system_id: self.core.system_id().to_string(),
            source,
        }
    }

    async fn open(&self) -> Result<(BoxReader, BoxWriter), CommError> {
        let endpoint = &self.core.endpoint;
        let stream = tokio::time::timeout(endpoint.timeout, TcpStream::connect(endpoint.socket_addr()))
            .await
            .map_err(|_| self.connect_error(anyhow!("timed out after {:?}", endpoint.timeout)))?
            .map_err(|e| self.connect_error(e.into()))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("{}: set_nodelay failed: {e}", endpoint.system_id);
        }

        match &endpoint.tls {
            Some(options) => {
                let connector = tokio_rustls::TlsConnector::from(tls::client_config(options)?);
                let name = tls::server_name(options, &endpoint.host)?;
                let stream = tokio::time::timeout(endpoint.timeout, connector.connect(name, stream))
                    .await
                    .map_err(|_| self.connect_error(anyhow!("tls handshake timed out")))?
                    .map_err(|e| self.connect_error(e.into()))?;
                let (reader, writer) = tokio::io::split(stream);
                Ok((Box::new(reader), Box::new(writer)))
            }
            None => {
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
        }
    }
}

/// Read frames until cancelled or the connection is lost.
///
/// A frame that is not a valid envelope is reported and skipped; the stream
/// stays aligned because the prefix already told us where it ends. A short
/// read or an oversized length prefix ends the connection.
async fn read_loop(
    core: Arc<HandlerCore>,
    mut reader: BoxReader,
    writer: SharedWriter,
    cancel: CancellationToken,
) {
    let peer = core.system_id().to_string();
    let max = core.options.max_frame_size;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = framing::read_message(&mut reader, max, &peer) => frame,
        };
        match frame {
            Ok(message) => core.dispatch(message),
            Err(e @ CommError::Deserialization(_)) => {
                core.fail(e);
            }
            Err(CommError::ConnectionClosed(_)) => {
                // Loss is not an error report; the health check picks it up.
                writer.lock().await.take();
                core.released(ConnectionState::Error);
                tracing::info!("{peer}: tcp connection lost");
                return;
            }
            Err(e) => {
                writer.lock().await.take();
                core.released(ConnectionState::Error);
                core.fail(e);
                return;
            }
        }
    }
}

#[async_trait::async_trait]
impl Connector for TcpHandler {
    async fn connect(&self) -> Result<(), CommError> {
        if self.core.is_connected() {
            return Ok(());
        }
        // Leftovers from a lost connection.
        self.receive.stop().await;

        self.core.set_connecting();
        let (reader, writer) = match self.open().await {
            Ok(halves) => halves,
            Err(e) => {
                self.core.released(ConnectionState::Error);
                return Err(self.core.fail(e));
            }
        };

        *self.writer.lock().await = Some(writer);
        self.core.opened();
        let core = self.core.clone();
        let shared = self.writer.clone();
        self.receive
            .start(move |cancel| read_loop(core, reader, shared, cancel));
        tracing::info!(
            "{}: tcp connected to {}",
            self.core.system_id(),
            self.core.endpoint.socket_addr()
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CommError> {
        self.receive.stop().await;
        if let Some(mut writer) = self.writer.lock().await.take() {
            match tokio::time::timeout(self.core.endpoint.timeout, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!("{}: tcp shutdown: {e}", self.core.system_id()),
                Err(_) => tracing::debug!("{}: tcp shutdown timed out", self.core.system_id()),
            }
        }
        self.core.released(ConnectionState::Disconnected);
        tracing::info!("{}: tcp disconnected", self.core.system_id());
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.core.state()
    }
}

#[async_trait::async_trait]
impl MessageSender for TcpHandler {
    async fn send_message(&self, message: &CrossSystemMessage) -> Result<(), CommError> {
        self.core.ensure_connected()?;
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| CommError::NotConnected(self.core.system_id().to_string()))?;

        let timeout = self.core.endpoint.timeout;
        let write = framing::write_message(
            writer.as_mut(),
            message,
            self.core.options.max_frame_size,
            self.core.system_id(),
        );
        let written = tokio::time::timeout(timeout, write).await;
        match written {
            Ok(Ok(())) => {
                self.core.metrics.record_sent();
                self.core.metrics.record_success();
                Ok(())
            }
            Ok(Err(e)) => Err(self.core.fail(e)),
            Err(_) => {
                // A half-written frame leaves the stream misaligned.
                guard.take();
                self.core.released(ConnectionState::Error);
                Err(self.core.fail(CommError::Send {
                    system_id: self.core.system_id().to_string(),
                    source: anyhow!("write stalled for {timeout:?}"),
                }))
            }
        }
    }
}

#[async_trait::async_trait]
impl MessageReceiver for TcpHandler {
    async fn receive_message(&self) -> Result<Option<CrossSystemMessage>, CommError> {
        self.core.next_inbound().await
    }
}

impl ConnectionHandler for TcpHandler {
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
