//! Cross-system transport layer.
//!
//! One connection contract ([`ConnectionHandler`]) over three transports:
//! HTTP/HTTPS request/response, WebSocket text frames, and length-prefixed
//! JSON over raw TCP (optionally TLS). Every transport carries the same
//! [`CrossSystemMessage`] envelope.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use xcomm_transport::{
//!     create_handler, ConnectionHandler, Connector, CrossSystemMessage, HandlerOptions,
//!     MessageSender, MessageType, Protocol, SystemEndpoint,
//! };
//!
//! # async fn example() -> Result<(), xcomm_transport::CommError> {
//! let endpoint = SystemEndpoint::new("svc-b", "Service B", Protocol::Tcp, "10.0.0.7", 9000);
//! let handler = create_handler(&endpoint, &HandlerOptions::new())?;
//! handler.on_message(Arc::new(|msg: &CrossSystemMessage| {
//!     println!("{} from {}", msg.message_type, msg.source_system);
//! }));
//!
//! handler.connect().await?;
//! let msg = CrossSystemMessage::new("m-1", "svc-a", "svc-b", MessageType::Event)
//!     .with_payload(serde_json::json!({"kind": "ping"}));
//! handler.send_message(&msg).await?;
//! handler.disconnect().await?;
//! # Ok(())
//! # }
//! ```

mod callbacks;
mod config;
mod endpoint;
mod error;
pub mod framing;
mod handler;
mod http;
mod message;
mod tcp;
mod tls;
mod websocket;

pub use callbacks::{invoke_guarded, ErrorCallback, HandlerCallbacks, Listeners, MessageCallback};
pub use config::{HandlerOptions, DEFAULT_MAX_FRAME_SIZE};
pub use endpoint::{Protocol, SystemEndpoint, TlsOptions};
pub use error::CommError;
pub use handler::{
    create_handler, ConnectionHandler, ConnectionState, Connector, HandlerFactory,
    MessageReceiver, MessageSender, ProtocolHandlerFactory,
};
pub use http::{method_for, query_params, request_headers, HealthProber, HttpHandler};
pub use message::{CrossSystemMessage, MessagePriority, MessageType, DEFAULT_MAX_RETRIES};
pub use tcp::TcpHandler;
pub use websocket::WebSocketHandler;

pub use xcomm_metrics::{now_ms, CommunicationMetrics};
