use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::CommError;
use xcomm_metrics::now_ms;

/// Kind of envelope; drives HTTP method selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Event,
    Command,
    Query,
    Notification,
    Heartbeat,
    Error,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Event => "event",
            MessageType::Command => "command",
            MessageType::Query => "query",
            MessageType::Notification => "notification",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Error => "error",
        };
        f.write_str(s)
    }
}

/// Delivery priority, totally ordered `Low < … < Emergency`.
///
/// Carried on the wire as its integer level (1..=5).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessagePriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
    Emergency = 5,
}

impl MessagePriority {
    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Self::Low),
            2 => Some(Self::Normal),
            3 => Some(Self::High),
            4 => Some(Self::Critical),
            5 => Some(Self::Emergency),
            _ => None,
        }
    }
}

impl Serialize for MessagePriority {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.level())
    }
}

impl<'de> Deserialize<'de> for MessagePriority {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let level = u8::deserialize(deserializer)?;
        Self::from_level(level)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid priority level {level}")))
    }
}

/// Default retry budget for new messages.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// The protocol-independent unit of exchange.
///
/// The JSON body on every transport carries the ten routing/payload fields.
/// `ttl`, `retry_count` and `max_retries` stay local to the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossSystemMessage {
    /// Caller-supplied; unique per in-flight message.
    pub message_id: String,
    pub source_system: String,
    pub target_system: String,
    pub message_type: MessageType,
    pub priority: MessagePriority,
    /// Unix ms at creation.
    pub timestamp: u64,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Lifetime in seconds from `timestamp`.
    #[serde(skip)]
    pub ttl: Option<u64>,
    #[serde(skip)]
    pub retry_count: u32,
    #[serde(skip, default = "default_max_retries")]
    pub max_retries: u32,
}

impl CrossSystemMessage {
    /// Create a message with the current timestamp and normal priority.
    pub fn new(
        message_id: impl Into<String>,
        source_system: impl Into<String>,
        target_system: impl Into<String>,
        message_type: MessageType,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            source_system: source_system.into(),
            target_system: target_system.into(),
            message_type,
            priority: MessagePriority::Normal,
            timestamp: now_ms(),
            payload: serde_json::Map::new(),
            headers: BTreeMap::new(),
            correlation_id: None,
            reply_to: None,
            ttl: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Replace the payload. Non-object values land under `"value"`.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = into_map(payload);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl = Some(ttl_secs);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self.retry_count = self.retry_count.min(max_retries);
        self
    }

    /// Correlation to use for replies: the explicit one, else our own id.
    pub fn reply_correlation(&self) -> String {
        self.correlation_id
            .clone()
            .unwrap_or_else(|| self.message_id.clone())
    }

    /// Build a RESPONSE travelling back to the sender.
    pub fn reply_to_message(&self, payload: serde_json::Value) -> Self {
        let target = self
            .reply_to
            .clone()
            .unwrap_or_else(|| self.source_system.clone());
        let mut reply = Self::new(
            uuid::Uuid::new_v4().to_string(),
            self.target_system.clone(),
            target,
            MessageType::Response,
        )
        .with_payload(payload);
        reply.priority = self.priority;
        reply.correlation_id = Some(self.reply_correlation());
        reply
    }

    /// Build an ERROR travelling back to the sender.
    pub fn error_reply(&self, payload: serde_json::Value) -> Self {
        let mut reply = self.reply_to_message(payload);
        reply.message_type = MessageType::Error;
        reply
    }

    /// Whether the TTL has elapsed at `now` (Unix ms).
    pub fn is_expired(&self, now: u64) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_sub(self.timestamp) >= ttl.saturating_mul(1000),
            None => false,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Count one more attempt. Never lets `retry_count` pass `max_retries`.
    pub fn record_retry(&mut self) -> Result<u32, CommError> {
        if !self.can_retry() {
            return Err(CommError::RetriesExhausted {
                message_id: self.message_id.clone(),
                max_retries: self.max_retries,
            });
        }
        self.retry_count += 1;
        Ok(self.retry_count)
    }

    pub fn to_json(&self) -> Result<String, CommError> {
        serde_json::to_string(self).map_err(CommError::Serialization)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CommError> {
        serde_json::to_vec(self).map_err(CommError::Serialization)
    }

    pub fn from_json(json: &str) -> Result<Self, CommError> {
        serde_json::from_str(json).map_err(CommError::Deserialization)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, CommError> {
        serde_json::from_slice(data).map_err(CommError::Deserialization)
    }
}

fn into_map(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
