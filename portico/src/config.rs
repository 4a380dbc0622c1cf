/// Configuration for the portico runtime.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker threads.
    pub workers: usize,
    /// Capacity of each worker's cross-thread inbox. A full inbox rejects
    /// the forward with [`Error::WorkerUnavailable`](crate::Error); senders
    /// hold a capacity-one slot per target, so this bounds the number of
    /// targets with in-flight forwards, not messages per target.
    pub inbox_capacity: usize,
    /// Capacity of each history ring (post-mortem entries per target).
    pub history_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 1,
            inbox_capacity: 4096,
            history_capacity: 64,
        }
    }
}
