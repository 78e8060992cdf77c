//! Periodic shallow health probes.
//!
//! HTTP-family endpoints are probed with `GET <base-url>/health` (healthy iff
//! 200). Any other endpoint is healthy iff it has a connected handler. Only
//! endpoints whose `health_check_interval` has elapsed are probed on a tick.

use std::sync::Weak;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use xcomm_transport::{now_ms, Connector, SystemEndpoint};

use crate::manager::{CommunicationManager, Inner};
use crate::status::SystemStateChange;

impl CommunicationManager {
    /// Run one probe cycle over every endpoint that is due, concurrently.
    pub async fn check_health_now(&self) {
        let now = now_ms();
        let due: Vec<SystemEndpoint> = self
            .inner
            .endpoints
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|ep| ep.health_check_due(now))
            .cloned()
            .collect();
        if due.is_empty() {
            return;
        }

        let probes = due.into_iter().map(|ep| async move {
            let healthy = self.probe(&ep).await;
            (ep.system_id, healthy)
        });
        let results = join_all(probes).await;

        let checked_at = now_ms();
        for (system_id, healthy) in results {
            let flipped = {
                let mut endpoints = self
                    .inner
                    .endpoints
                    .write()
                    .unwrap_or_else(|p| p.into_inner());
                // Removed while the probe was in flight.
                let Some(ep) = endpoints.get_mut(&system_id) else {
                    continue;
                };
                ep.last_health_check = Some(checked_at);
                let flipped = ep.is_healthy != healthy;
                ep.is_healthy = healthy;
                flipped
            };

            if flipped {
                let change = if healthy {
                    tracing::info!("{system_id} is healthy again");
                    SystemStateChange::Healthy
                } else {
                    tracing::warn!("{system_id} is unhealthy");
                    SystemStateChange::Unhealthy
                };
                self.notify_state(&system_id, change);
            }
        }
    }

    async fn probe(&self, endpoint: &SystemEndpoint) -> bool {
        if endpoint.protocol.is_http() {
            self.inner.prober.probe(endpoint).await
        } else {
            self.handler(&endpoint.system_id)
                .is_some_and(|h| h.is_connected())
        }
    }
}

/// Tick every `tick` until cancelled or the manager is gone. The immediate
/// first tick is skipped.
pub(crate) async fn run(inner: Weak<Inner>, tick: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                let manager = CommunicationManager { inner };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = manager.check_health_now() => {}
                }
            }
        }
    }
    tracing::debug!("health loop stopped");
}
