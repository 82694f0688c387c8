//! # Thundering-herd prevention for Memcached clients
//!
//! This crate sits between application code and a Memcached cluster and
//! mediates the computation of expensive cached values. Given a key, a
//! compute callback, and an expiration, [`Cacher::get_or_compute`] returns
//! either a fresh cache hit, a marginally stale value, or a freshly
//! computed value — while guaranteeing that a near-synchronous fleet of
//! callers does not stampede the system producing the value.
//!
//! ## How it works
//!
//! Every managed key stores an [`Envelope`]: a `(processing, soft_expiry,
//! value)` tuple. The `soft_expiry` is this layer's own expiration; the
//! Memcached-level TTL on the entry is set `ceil(compute_time)` seconds
//! later, so a soft-expired value keeps a bounded afterlife during
//! recomputation.
//!
//! Mutual exclusion is built from the store's own primitives — there is no
//! native locking, only atomic insert and optimistic compare-and-swap:
//!
//! - An absent key is claimed with `add`: exactly one concurrent caller
//!   wins the insert of a lock placeholder.
//! - A soft-expired key is claimed with `gets` + `cas`: exactly one caller
//!   flips the `processing` flag, while others keep reading the stale
//!   value.
//! - The lock holder computes, then publishes with a plain `set` — safe
//!   because at most one producer holds the lock per epoch.
//!
//! Lock placeholders carry a TTL of `ceil(compute_time)`, so a holder that
//! crashes without publishing releases the key within that bound.
//!
//! Callers that lose a race fall through to the waiter policy
//! ([`Wait`] / [`WaitMany`]): by default a bounded sleep followed by a
//! single retry of the whole coordinator, or an application callback for
//! fail-fast and back-pressure strategies.
//!
//! [`Cacher::get_or_compute_many`] preserves the same per-key state
//! machine while batching every store interaction — at most one
//! `get_multi`, `gets_multi`, `cas_multi`, `add_multi`, and `set_multi`
//! per pass — and invokes the compute callback once for all keys the
//! caller locked.
//!
//! ## What this layer is not
//!
//! There is no cross-key atomicity and no consistency guarantee between
//! the cache and the backing store. Keys managed by this protocol must not
//! be shared with writers of raw, non-envelope values. Compute failures
//! are not retried; they propagate to the lock holder and the placeholder
//! TTL governs recovery.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use herdcache::{Cacher, Wait, DEFAULT_COMPUTE_TIME};
//! use herdcache_test::{MockClock, MockMemcache};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), herdcache::Error> {
//! let clock = Arc::new(MockClock::new(1_600_000_000.0));
//! let cacher = Cacher::with_clock(MockMemcache::new(clock.clone()), clock);
//!
//! let value = cacher
//!     .get_or_compute(
//!         "report:daily",
//!         60.0,
//!         || async { Ok::<_, herdcache::Error>("expensive result".to_string()) },
//!         DEFAULT_COMPUTE_TIME,
//!         Wait::Default,
//!     )
//!     .await?;
//! assert_eq!(value.as_deref(), Some("expensive result"));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod cacher;
mod client;
mod clock;
mod envelope;
mod error;
mod expiration;
mod waiter;

pub use cacher::{Cacher, DEFAULT_COMPUTE_TIME};
pub use client::{AddOp, CasOp, MemcacheClient, SetOp};
pub use clock::{Clock, SystemClock};
pub use envelope::Envelope;
pub use error::Error;
pub use waiter::{Wait, WaitFn, WaitMany, WaitManyFn};
