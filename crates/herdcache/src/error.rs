use std::fmt;

use thiserror::Error;

/// An error surfaced by the coordination layer.
///
/// Lock contention is *not* an error: losing an `add` or `cas` race simply
/// routes the caller to the waiter. The variants here are the failures that
/// propagate to the caller unchanged.
#[derive(Debug, Error)]
pub enum Error {
    /// The Memcached client failed to talk to the cluster.
    ///
    /// Raised by [`MemcacheClient`](crate::MemcacheClient) implementations;
    /// the coordinator performs no retries beyond the documented waiter
    /// retry.
    #[error("memcached transport: {0}")]
    Transport(String),

    /// An envelope could not be encoded or decoded.
    ///
    /// Typically means a non-envelope value was written under a managed key
    /// by something outside this layer.
    #[error("envelope codec: {0}")]
    Codec(#[from] serde_json::Error),

    /// The compute callback failed.
    ///
    /// Propagates to the lock holder. Nothing is written to the cache, so
    /// the lock placeholder's TTL alone governs recovery.
    #[error("compute callback: {0}")]
    Compute(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Malformed caller input, detected before any network activity.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Creates a [`Error::Transport`] from any displayable client error.
    pub fn transport(message: impl fmt::Display) -> Self {
        Error::Transport(message.to_string())
    }

    /// Wraps an application error from a compute callback.
    pub fn compute(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Compute(Box::new(source))
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }
}
