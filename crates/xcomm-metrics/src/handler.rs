use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::{now_ms, CommunicationMetrics, Counter, Gauge};

/// Live counters owned by one connection handler.
///
/// Shared between the handler and its receive loop, so every field is
/// atomic and every method takes `&self`.
#[derive(Debug, Default)]
pub struct HandlerMetrics {
    sent: Counter,
    received: Counter,
    succeeded: Counter,
    failed: Counter,
    active_connections: Gauge,
    response_time_us: Counter,
    timed_responses: Counter,
    last_activity_ms: AtomicU64,
}

impl HandlerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.sent.inc();
        self.touch();
    }

    pub fn record_received(&self) {
        self.received.inc();
        self.touch();
    }

    pub fn record_success(&self) {
        self.succeeded.inc();
    }

    pub fn record_failure(&self) {
        self.failed.inc();
        self.touch();
    }

    pub fn record_response_time(&self, elapsed: Duration) {
        self.response_time_us.inc_by(elapsed.as_micros() as u64);
        self.timed_responses.inc();
    }

    pub fn connection_opened(&self) {
        self.active_connections.inc();
        self.touch();
    }

    pub fn connection_closed(&self) {
        self.active_connections.dec();
        self.touch();
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.get()
    }

    fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CommunicationMetrics {
        let timed = self.timed_responses.get();
        let total_secs = self.response_time_us.get() as f64 / 1_000_000.0;
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        CommunicationMetrics {
            total_messages_sent: self.sent.get(),
            total_messages_received: self.received.get(),
            successful_communications: self.succeeded.get(),
            failed_communications: self.failed.get(),
            active_connections: self.active_connections.get(),
            total_response_time: total_secs,
            average_response_time: if timed == 0 {
                0.0
            } else {
                total_secs / timed as f64
            },
            timed_responses: timed,
            last_activity: (last != 0).then_some(last),
        }
    }
}
