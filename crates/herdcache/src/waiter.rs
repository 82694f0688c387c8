//! What a caller does after losing the lock race.
//!
//! Losing an `add` or `cas` race is not an error: some other caller is
//! already computing. The waiter decides what happens next — a bounded
//! sleep followed by a single retry of the whole coordinator, or an
//! application-supplied fallback (fail fast, read from primary, apply
//! back-pressure). The retry runs with no waiter left, so a second loss
//! yields the empty result; this bounds the protocol to one level of
//! retry.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::Error;

/// Single-key waiter callback. Invoked when the lock race is lost; its
/// result becomes the result of the call.
pub type WaitFn<V> = Box<dyn FnOnce() -> BoxFuture<'static, Result<Option<V>, Error>> + Send>;

/// Multi-key waiter callback. Receives the still-unresolved keys and must
/// return a mapping for whichever of them it can resolve.
pub type WaitManyFn<V> =
    Box<dyn FnOnce(Vec<String>) -> BoxFuture<'static, Result<HashMap<String, V>, Error>> + Send>;

/// Waiter policy for [`Cacher::get_or_compute`](crate::Cacher::get_or_compute).
pub enum Wait<V> {
    /// Sleep for `compute_time`, then retry the coordinator once.
    Default,
    /// Sleep for the given duration, then retry the coordinator once.
    Duration(Duration),
    /// Yield to the callback and return whatever it returns.
    Callback(WaitFn<V>),
}

/// Waiter policy for
/// [`Cacher::get_or_compute_many`](crate::Cacher::get_or_compute_many).
pub enum WaitMany<V> {
    /// Sleep for `compute_time`, then retry the waiting subset once.
    Default,
    /// Sleep for the given duration, then retry the waiting subset once.
    Duration(Duration),
    /// Yield to the callback with the waiting keys and merge its result.
    Callback(WaitManyFn<V>),
}

impl<V> Default for Wait<V> {
    fn default() -> Self {
        Wait::Default
    }
}

impl<V> Default for WaitMany<V> {
    fn default() -> Self {
        WaitMany::Default
    }
}

impl<V> std::fmt::Debug for Wait<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Wait::Default => f.write_str("Wait::Default"),
            Wait::Duration(d) => f.debug_tuple("Wait::Duration").field(d).finish(),
            Wait::Callback(_) => f.write_str("Wait::Callback(..)"),
        }
    }
}

impl<V> std::fmt::Debug for WaitMany<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitMany::Default => f.write_str("WaitMany::Default"),
            WaitMany::Duration(d) => f.debug_tuple("WaitMany::Duration").field(d).finish(),
            WaitMany::Callback(_) => f.write_str("WaitMany::Callback(..)"),
        }
    }
}
