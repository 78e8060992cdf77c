use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context};
use xcomm_transport::{MessagePriority, MessageType, SystemEndpoint};

/// Load a JSON array of endpoints. Duplicate ids are rejected up front
/// rather than silently dropped by the registry.
pub fn load(path: &Path) -> anyhow::Result<Vec<SystemEndpoint>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading endpoints from {}", path.display()))?;
    let endpoints: Vec<SystemEndpoint> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing endpoints in {}", path.display()))?;

    let mut seen = HashSet::new();
    for ep in &endpoints {
        if !seen.insert(ep.system_id.as_str()) {
            bail!("duplicate system_id {:?} in {}", ep.system_id, path.display());
        }
    }
    Ok(endpoints)
}

pub fn parse_message_type(s: &str) -> Result<MessageType, String> {
    serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
        .map_err(|_| format!("unknown message type {s:?}"))
}

pub fn parse_priority(s: &str) -> Result<MessagePriority, String> {
    s.parse::<u8>()
        .ok()
        .and_then(MessagePriority::from_level)
        .ok_or_else(|| format!("priority must be 1..=5, got {s:?}"))
}
