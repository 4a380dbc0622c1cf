use std::time::Duration;

/// HTTP/2 stream-core tunables.
///
/// One instance per connection; streams hold a shared reference for their
/// lifetime.
#[derive(Debug, Clone)]
pub struct Http2Params {
    /// Initial per-stream receive window granted to the peer (our
    /// SETTINGS_INITIAL_WINDOW_SIZE).
    pub initial_recv_window: i64,
    /// Initial per-stream send window (the peer's
    /// SETTINGS_INITIAL_WINDOW_SIZE until updated).
    pub initial_send_window: i64,
    /// Floor for the running average of WINDOW_UPDATE increments we emit.
    /// A peer draining the window in crumbs drags the average below this
    /// and is answered with ENHANCE_YOUR_CALM.
    pub min_avg_window_update: f64,
    /// Delay before re-attempting a driver callback that was busy.
    pub retry_delay: Duration,
    /// Transactions slower than this get a slow-log record on destruction.
    /// `None` disables the slow log.
    pub slow_log_threshold: Option<Duration>,
    /// Block size for stream byte rings.
    pub buffer_block_size: usize,
    /// Capacity of the per-stream history ring.
    pub history_capacity: usize,
}

impl Default for Http2Params {
    fn default() -> Self {
        Self {
            initial_recv_window: 65535,
            initial_send_window: 65535,
            min_avg_window_update: 2560.0,
            retry_delay: Duration::from_millis(10),
            slow_log_threshold: None,
            buffer_block_size: 4096,
            history_capacity: 64,
        }
    }
}
