use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Transport protocol of an endpoint.
///
/// UDP is accepted in the registry but has no handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    #[serde(alias = "ws")]
    WebSocket,
    Tcp,
    Udp,
}

impl Protocol {
    /// HTTP and HTTPS share the request/response handler.
    pub fn is_http(&self) -> bool {
        matches!(self, Protocol::Http | Protocol::Https)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::WebSocket => "websocket",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        f.write_str(s)
    }
}

/// TLS material for an endpoint.
///
/// Server certificates are verified against the bundled web PKI roots plus
/// the optional PEM bundle at `ca_cert_path`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Extra trust anchors (PEM).
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// Name to verify instead of the endpoint host (TCP only).
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Identity and connection parameters for one remote system.
#[derive(Clone, Serialize, Deserialize)]
pub struct SystemEndpoint {
    pub system_id: String,
    pub name: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub path: String,
    /// Opaque to the transport. Never serialized back out.
    #[serde(default, skip_serializing)]
    pub credentials: Option<HashMap<String, String>>,
    #[serde(default)]
    pub tls: Option<TlsOptions>,
    /// Applied to connect and to each HTTP request.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_health_check_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,
    #[serde(default = "default_healthy")]
    pub is_healthy: bool,
    /// Unix ms of the last completed probe.
    #[serde(default)]
    pub last_health_check: Option<u64>,
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_healthy() -> bool {
    true
}

impl SystemEndpoint {
    pub fn new(
        system_id: impl Into<String>,
        name: impl Into<String>,
        protocol: Protocol,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            system_id: system_id.into(),
            name: name.into(),
            protocol,
            host: host.into(),
            port,
            path: String::new(),
            credentials: None,
            tls: None,
            timeout: default_timeout(),
            retry_attempts: default_retry_attempts(),
            health_check_interval: default_health_check_interval(),
            is_healthy: true,
            last_health_check: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_credentials(mut self, credentials: HashMap<String, String>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// `scheme://host:port` for HTTP-family and WebSocket endpoints.
    pub fn base_url(&self) -> String {
        let scheme = match self.protocol {
            Protocol::Https => "https",
            Protocol::WebSocket if self.tls.is_some() => "wss",
            Protocol::WebSocket => "ws",
            Protocol::Http if self.tls.is_some() => "https",
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// Base URL joined with the endpoint path.
    pub fn url(&self) -> String {
        let base = self.base_url();
        if self.path.is_empty() {
            return base;
        }
        if self.path.starts_with('/') {
            format!("{base}{}", self.path)
        } else {
            format!("{base}/{}", self.path)
        }
    }

    /// Health probe URL (`<base-url>/health`).
    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url())
    }

    /// `host:port` for socket connects.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether the endpoint is due for a probe at `now` (Unix ms).
    pub fn health_check_due(&self, now: u64) -> bool {
        match self.last_health_check {
            None => true,
            Some(last) => {
                now.saturating_sub(last) >= self.health_check_interval.as_millis() as u64
            }
        }
    }
}

impl fmt::Debug for SystemEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemEndpoint")
            .field("system_id", &self.system_id)
            .field("protocol", &self.protocol)
            .field("addr", &self.socket_addr())
            .field("path", &self.path)
            .field("tls", &self.tls.is_some())
            .field("is_healthy", &self.is_healthy)
            .finish_non_exhaustive()
    }
}
