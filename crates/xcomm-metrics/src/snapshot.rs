use serde::{Deserialize, Serialize};

/// Point-in-time view of communication counters.
///
/// Produced per handler by [`HandlerMetrics::snapshot`](crate::HandlerMetrics::snapshot)
/// and re-aggregated by the manager with [`merge`](Self::merge).
/// Response times are in seconds and only populated by request/response
/// transports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommunicationMetrics {
    pub total_messages_sent: u64,
    pub total_messages_received: u64,
    pub successful_communications: u64,
    pub failed_communications: u64,
    pub active_connections: u64,
    pub total_response_time: f64,
    pub average_response_time: f64,
    /// Number of responses folded into `total_response_time`.
    pub timed_responses: u64,
    /// Unix ms of the most recent send, receive, connect or disconnect.
    pub last_activity: Option<u64>,
}

impl CommunicationMetrics {
    /// Fold `other` into `self`, recomputing the average from the combined
    /// totals rather than averaging the averages.
    pub fn merge(&mut self, other: &CommunicationMetrics) {
        self.total_messages_sent += other.total_messages_sent;
        self.total_messages_received += other.total_messages_received;
        self.successful_communications += other.successful_communications;
        self.failed_communications += other.failed_communications;
        self.active_connections += other.active_connections;
        self.total_response_time += other.total_response_time;
        self.timed_responses += other.timed_responses;
        self.average_response_time = if self.timed_responses == 0 {
            0.0
        } else {
            self.total_response_time / self.timed_responses as f64
        };
        self.last_activity = match (self.last_activity, other.last_activity) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    /// Total number of communications that reached a verdict.
    pub fn total_communications(&self) -> u64 {
        self.successful_communications + self.failed_communications
    }

    /// Fraction of communications that succeeded, `None` before the first one.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.total_communications();
        (total > 0).then(|| self.successful_communications as f64 / total as f64)
    }
}
