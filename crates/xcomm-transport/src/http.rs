//! HTTP/HTTPS request/response handler.
//!
//! Each send is one request. The reply (or a synthesized ERROR for status
//! >= 400) comes back through the message listeners so callers treat HTTP
//! like the streaming transports.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::json;
use xcomm_metrics::CommunicationMetrics;

use crate::callbacks::{ErrorCallback, MessageCallback};
use crate::config::HandlerOptions;
use crate::endpoint::SystemEndpoint;
use crate::handler::{
    ConnectionHandler, ConnectionState, Connector, HandlerCore, MessageReceiver, MessageSender,
};
use crate::message::{CrossSystemMessage, MessageType};
use crate::{tls, CommError};

pub struct HttpHandler {
    core: HandlerCore,
    client: Mutex<Option<reqwest::Client>>,
}

impl HttpHandler {
    pub fn new(endpoint: SystemEndpoint, options: HandlerOptions) -> Self {
        Self {
            core: HandlerCore::new(endpoint, options),
            client: Mutex::new(None),
        }
    }

    fn client(&self) -> Result<reqwest::Client, CommError> {
        self.core.ensure_connected()?;
        self.client
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| CommError::NotConnected(self.core.system_id().to_string()))
    }

    fn set_client(&self, client: Option<reqwest::Client>) {
        *self.client.lock().unwrap_or_else(|p| p.into_inner()) = client;
    }
}

/// REQUEST→POST, COMMAND→PUT, QUERY→GET, everything else→POST.
pub fn method_for(message_type: MessageType) -> Method {
    match message_type {
        MessageType::Command => Method::PUT,
        MessageType::Query => Method::GET,
        _ => Method::POST,
    }
}

/// Envelope headers with caller-supplied headers merged over them.
pub fn request_headers(message: &CrossSystemMessage) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let mut fixed = vec![
        ("x-message-id", message.message_id.clone()),
        ("x-source-system", message.source_system.clone()),
        ("x-message-type", message.message_type.to_string()),
        ("x-priority", message.priority.level().to_string()),
    ];
    if let Some(correlation_id) = &message.correlation_id {
        fixed.push(("x-correlation-id", correlation_id.clone()));
    }
    for (name, value) in fixed {
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                headers.insert(HeaderName::from_static(name), value);
            }
            Err(_) => tracing::warn!("dropping unencodable {name} header"),
        }
    }

    for (name, value) in &message.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!("dropping invalid caller header {name:?}"),
        }
    }
    headers
}

/// GET parameters from the top-level payload entries.
pub fn query_params(payload: &serde_json::Map<String, serde_json::Value>) -> Vec<(String, String)> {
    payload
        .iter()
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect()
}

pub(crate) fn build_client(endpoint: &SystemEndpoint) -> Result<reqwest::Client, CommError> {
    let mut builder = reqwest::Client::builder()
        .timeout(endpoint.timeout)
        .connect_timeout(endpoint.timeout);

    if let Some(options) = &endpoint.tls {
        if let Some(pem) = tls::ca_pem(options)? {
            let cert =
                reqwest::Certificate::from_pem(&pem).map_err(|e| CommError::Tls(e.to_string()))?;
            builder = builder.add_root_certificate(cert);
        }
    }

    builder.build().map_err(|e| CommError::Connect {
        system_id: endpoint.system_id.clone(),
        source: e.into(),
    })
}

/// Shallow `GET <base-url>/health` checks, healthy iff the answer is 200.
///
/// Keeps one client (and its connection pool) per system id so periodic
/// probes do not rebuild TLS state every tick.
#[derive(Default)]
pub struct HealthProber {
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl HealthProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn probe(&self, endpoint: &SystemEndpoint) -> bool {
        let client = match self.client_for(endpoint) {
            Ok(client) => client,
            Err(e) => {
                tracing::debug!("health probe for {} not attempted: {e}", endpoint.system_id);
                return false;
            }
        };
        match client.get(endpoint.health_url()).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                tracing::debug!("health probe for {} failed: {e}", endpoint.system_id);
                false
            }
        }
    }

    /// Drop the cached client, e.g. when the endpoint is unregistered.
    pub fn forget(&self, system_id: &str) {
        self.clients
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(system_id);
    }

    fn client_for(&self, endpoint: &SystemEndpoint) -> Result<reqwest::Client, CommError> {
        let mut clients = self.clients.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(client) = clients.get(&endpoint.system_id) {
            return Ok(client.clone());
        }
        let client = build_client(endpoint)?;
        clients.insert(endpoint.system_id.clone(), client.clone());
        Ok(client)
    }
}

/// Body as JSON; non-JSON text is kept as a string, empty as null.
fn parse_body(body: &[u8]) -> serde_json::Value {
    if body.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(body).into_owned()))
}

#[async_trait::async_trait]
impl Connector for HttpHandler {
    async fn connect(&self) -> Result<(), CommError> {
        if self.core.is_connected() {
            return Ok(());
        }
        self.core.set_connecting();
        match build_client(&self.core.endpoint) {
            Ok(client) => {
                self.set_client(Some(client));
                self.core.opened();
                tracing::info!(
                    "{}: http session ready for {}",
                    self.core.system_id(),
                    self.core.endpoint.url()
                );
                Ok(())
            }
            Err(e) => {
                self.core.released(ConnectionState::Error);
                Err(self.core.fail(e))
            }
        }
    }

    async fn disconnect(&self) -> Result<(), CommError> {
        self.set_client(None);
        self.core.released(ConnectionState::Disconnected);
        tracing::info!("{}: http session closed", self.core.system_id());
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.core.state()
    }
}

#[async_trait::async_trait]
impl MessageSender for HttpHandler {
    async fn send_message(&self, message: &CrossSystemMessage) -> Result<(), CommError> {
        let client = self.client()?;
        let method = method_for(message.message_type);
        let mut request = client
            .request(method.clone(), self.core.endpoint.url())
            .headers(request_headers(message));
        request = if method == Method::GET {
            request.query(&query_params(&message.payload))
        } else {
            request.json(message)
        };

        let started = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return Err(self.core.fail(CommError::Send {
                    system_id: self.core.system_id().to_string(),
                    source: e.into(),
                }))
            }
        };
        let status = response.status();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                return Err(self.core.fail(CommError::Send {
                    system_id: self.core.system_id().to_string(),
                    source: e.into(),
                }))
            }
        };
        self.core.metrics.record_response_time(started.elapsed());
        self.core.metrics.record_sent();

        if status.as_u16() >= 400 {
            let reply = message.error_reply(json!({
                "status": status.as_u16(),
                "error": parse_body(&body),
            }));
            self.core.dispatch(reply);
            return Err(self.core.fail(CommError::HttpStatus {
                system_id: self.core.system_id().to_string(),
                status: status.as_u16(),
            }));
        }

        self.core.metrics.record_success();
        let reply = CrossSystemMessage::from_slice(&body)
            .unwrap_or_else(|_| message.reply_to_message(parse_body(&body)));
        self.core.dispatch(reply);
        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageReceiver for HttpHandler {
    async fn receive_message(&self) -> Result<Option<CrossSystemMessage>, CommError> {
        Ok(None)
    }
}

impl ConnectionHandler for HttpHandler {
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
