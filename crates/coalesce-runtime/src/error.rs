//! Runtime error types.

use coalesce_core::ResourceError;
use thiserror::Error;

/// Errors from spawning the worker or submitting requests to it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Invalid configuration (zero capacity, zero tick interval, etc.).
    ///
    /// Fatal: the worker is not spawned. Fix the configuration and retry.
    #[error("configuration error: {0}")]
    Config(String),

    /// Backlog full; the request was not queued.
    ///
    /// Reported synchronously to the producer. Transient once the worker
    /// catches up.
    #[error("request queue full (capacity {capacity})")]
    Overflow {
        /// Configured backlog size
        capacity: usize,
    },

    /// The worker has shut down.
    #[error("request queue closed")]
    Closed,

    /// A prewarm could not open its resource.
    #[error("open failed: {0}")]
    Open(#[from] ResourceError),
}
