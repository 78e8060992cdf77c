/// Default cap on a single TCP frame body.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Per-handler tuning shared by every protocol.
///
/// ```rust
/// use xcomm_transport::HandlerOptions;
///
/// let options = HandlerOptions::new()
///     .max_frame_size(2 * 1024 * 1024)
///     .inbound_buffer(512);
/// ```
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Maximum length-prefixed body accepted or written on TCP.
    pub(crate) max_frame_size: usize,
    /// Capacity of the fan-out buffer behind `receive_message`.
    pub(crate) inbound_buffer: usize,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            inbound_buffer: 256,
        }
    }

    /// Set maximum TCP frame size (default: 16 MiB).
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Set the inbound fan-out capacity (default: 256, minimum 1).
    pub fn inbound_buffer(mut self, capacity: usize) -> Self {
        self.inbound_buffer = capacity.max(1);
        self
    }
}
