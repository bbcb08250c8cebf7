//! Error taxonomy for the performance backbone.
//!
//! The cache layer is fail-open for reads and fail-quiet for writes and
//! invalidations: a shared-store outage degrades to the uncached path and
//! never surfaces to handlers. The one exception is `DeadlineExceeded`,
//! which is always propagated to the caller.
//!
//! Alert conditions raised by the query monitor are not errors at all;
//! they surface as [`MonitorEvent::Alert`](crate::monitor::MonitorEvent)
//! on the monitor's broadcast channel.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, BackboneError>;

/// Errors produced by the backbone components.
#[derive(Debug, Error)]
pub enum BackboneError {
    /// The shared store could not be reached or answered with an error.
    /// Callers treat this as a miss on reads and a no-op on writes.
    #[error("shared store unavailable: {0}")]
    StoreUnavailable(String),

    /// A value could not be serialized or deserialized through the codec.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A stored envelope was flagged compressed but did not decode.
    /// The entry is evicted and the read treated as a miss.
    #[error("decompression failed for key '{key}': {reason}")]
    DecompressFailed { key: String, reason: String },

    /// A response body exceeds the configured cache limit and is not stored.
    #[error("response body of {size} bytes exceeds cache limit of {limit} bytes")]
    ResponseTooLarge { size: usize, limit: usize },

    /// The caller's deadline elapsed while waiting on a suspension point.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A deduplicated request's originator went away without settling.
    /// The waiter should fall back to the uncached path.
    #[error("deduplication originator dropped before settling")]
    OriginatorGone,

    /// An invalidation action exhausted its retry budget.
    #[error("invalidation of '{target}' failed after {attempts} attempts: {reason}")]
    InvalidationFailed {
        target: String,
        attempts: u32,
        reason: String,
    },

    /// The component is shutting down and no longer accepts work.
    #[error("component is shutting down")]
    ShuttingDown,
}

impl From<serde_json::Error> for BackboneError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for BackboneError {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}
