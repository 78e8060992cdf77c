use std::collections::BTreeMap;

use serde::Serialize;
use xcomm_manager::{CommunicationManager, ManagerConfig, ManagerStatus};
use xcomm_transport::{CommunicationMetrics, SystemEndpoint};

use crate::output::emit;

#[derive(Serialize)]
struct ProbeReport {
    connected: BTreeMap<String, bool>,
    status: ManagerStatus,
    metrics: CommunicationMetrics,
}

/// Connect everything, run one health cycle, print the result, disconnect.
pub async fn run(endpoints: Vec<SystemEndpoint>) -> anyhow::Result<()> {
    let manager = CommunicationManager::new(ManagerConfig::new());
    manager.on_error(|id, err| eprintln!("{id}: {err}"));

    let ids: Vec<String> = endpoints.iter().map(|ep| ep.system_id.clone()).collect();
    for endpoint in endpoints {
        manager.add_endpoint(endpoint);
    }

    let mut connected = BTreeMap::new();
    for id in ids {
        let ok = manager.connect_system(&id).await;
        connected.insert(id, ok);
    }
    manager.check_health_now().await;

    let report = ProbeReport {
        connected,
        status: manager.get_system_status(),
        metrics: manager.get_metrics(),
    };
    emit(&report)?;

    manager.stop().await;
    Ok(())
}
