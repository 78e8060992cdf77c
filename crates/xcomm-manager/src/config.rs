use std::time::Duration;

use xcomm_transport::HandlerOptions;

/// Default period of the health-check loop.
pub const DEFAULT_HEALTH_CHECK_TICK: Duration = Duration::from_secs(10);

/// Configuration for a [`CommunicationManager`](crate::CommunicationManager).
///
/// ```rust
/// use std::time::Duration;
/// use xcomm_manager::ManagerConfig;
///
/// let config = ManagerConfig::new()
///     .health_check_tick(Duration::from_secs(5))
///     .inbound_queue_capacity(4096);
/// ```
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How often the health loop looks for endpoints that are due a probe.
    pub(crate) health_check_tick: Duration,
    /// Bound of the queue between handler receive loops and the processor.
    pub(crate) inbound_queue_capacity: usize,
    /// Passed to every handler the manager creates.
    pub(crate) handler_options: HandlerOptions,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerConfig {
    /// Create a config with defaults.
    ///
    /// If `XCOMM_HEALTH_CHECK_SECS` is set to a positive integer it replaces
    /// the 10 s health tick. This can be overridden with
    /// [`.health_check_tick()`](Self::health_check_tick).
    pub fn new() -> Self {
        let health_check_tick = std::env::var("XCOMM_HEALTH_CHECK_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_HEALTH_CHECK_TICK);

        Self {
            health_check_tick,
            inbound_queue_capacity: 1024,
            handler_options: HandlerOptions::new(),
        }
    }

    /// Set the health-check tick (default: 10 s). Zero is raised to 1 ms.
    pub fn health_check_tick(mut self, tick: Duration) -> Self {
        self.health_check_tick = tick.max(Duration::from_millis(1));
        self
    }

    /// Set the inbound queue bound (default: 1024, minimum 1).
    pub fn inbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.inbound_queue_capacity = capacity.max(1);
        self
    }

    /// Set the options handed to every handler.
    pub fn handler_options(mut self, options: HandlerOptions) -> Self {
        self.handler_options = options;
        self
    }
}
