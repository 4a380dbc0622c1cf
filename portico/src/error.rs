use std::io;

use thiserror::Error;

/// Errors returned by the portico runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// Worker thread creation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Target worker's inbox is full or the worker has exited.
    #[error("worker unavailable")]
    WorkerUnavailable,
}
