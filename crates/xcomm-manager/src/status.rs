use serde::Serialize;
use xcomm_transport::{CommunicationMetrics, Protocol, SystemEndpoint};

/// Connection or health transition of one system, as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStateChange {
    Connected,
    Disconnected,
    ConnectFailed,
    Healthy,
    Unhealthy,
}

/// Read-only view of one registered system.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub system_id: String,
    pub name: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub is_healthy: bool,
    /// False whenever no handler exists, whatever `is_healthy` says.
    pub is_connected: bool,
    pub last_health_check: Option<u64>,
    /// Counters of the live handler, if any.
    pub metrics: Option<CommunicationMetrics>,
}

impl SystemStatus {
    pub(crate) fn new(
        endpoint: &SystemEndpoint,
        is_connected: bool,
        metrics: Option<CommunicationMetrics>,
    ) -> Self {
        Self {
            system_id: endpoint.system_id.clone(),
            name: endpoint.name.clone(),
            protocol: endpoint.protocol,
            host: endpoint.host.clone(),
            port: endpoint.port,
            is_healthy: endpoint.is_healthy,
            is_connected,
            last_health_check: endpoint.last_health_check,
            metrics,
        }
    }
}

/// Read-only view of the whole manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerStatus {
    pub running: bool,
    pub total_endpoints: usize,
    pub connected_systems: usize,
    pub healthy_systems: usize,
    /// Sorted by `system_id`.
    pub systems: Vec<SystemStatus>,
}
