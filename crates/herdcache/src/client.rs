//! The Memcached client contract the coordinator runs on.
//!
//! The protocol achieves mutual exclusion entirely through the store's own
//! primitives: `add` (atomic insert-if-absent) takes the cold lock, `gets`
//! plus `cas` takes the warm re-lock, and plain `set` publishes a computed
//! value — safe because at most one producer holds the lock per epoch. The
//! batch variants exist so the multi-key coordinator can drive many keys
//! with one round-trip per phase.
//!
//! Implementations move opaque envelope bytes; the envelope codec lives in
//! [`crate::envelope`]. Transport failures are reported as
//! [`Error::Transport`](crate::Error::Transport) and propagate to the
//! caller unchanged.

use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::Error;

/// A batched `add` operation: insert `value` under `key` iff absent.
#[derive(Debug, Clone)]
pub struct AddOp {
    /// Target key.
    pub key: String,
    /// Encoded envelope bytes.
    pub value: Vec<u8>,
    /// Relative TTL in seconds.
    pub ttl: u32,
}

/// A batched `cas` operation: replace `key` iff its token still matches.
#[derive(Debug, Clone)]
pub struct CasOp<T> {
    /// Target key.
    pub key: String,
    /// The token returned by the preceding `gets`.
    pub token: T,
    /// Encoded envelope bytes.
    pub value: Vec<u8>,
    /// Relative TTL in seconds.
    pub ttl: u32,
}

/// A batched unconditional `set`.
#[derive(Debug, Clone)]
pub struct SetOp {
    /// Target key.
    pub key: String,
    /// Encoded envelope bytes.
    pub value: Vec<u8>,
    /// Relative TTL in seconds.
    pub ttl: u32,
}

/// The operations the coordination protocol requires from a Memcached
/// client.
///
/// All TTLs are relative seconds. Per-key results of the batch mutations
/// come back as keyed maps; a key missing from an `add_multi` or
/// `cas_multi` result counts as a failure for that key. `get_multi` and
/// `gets_multi` omit absent keys from their result maps.
pub trait MemcacheClient: Send + Sync {
    /// Opaque compare-and-swap token, returned by `gets` and consumed by
    /// `cas`.
    type Token: Send;

    /// Reads the bytes under `key`, or `None` if absent.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, Error>>;

    /// Reads the bytes under `key` together with their CAS token.
    fn gets<'a>(
        &'a self,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<(Self::Token, Vec<u8>)>, Error>>;

    /// Atomic insert iff the key is absent. Returns whether the insert won.
    fn add<'a>(&'a self, key: &'a str, value: Vec<u8>, ttl: u32)
        -> BoxFuture<'a, Result<bool, Error>>;

    /// Atomic replace iff the key still carries `token`. Returns whether
    /// the replace won.
    fn cas<'a>(
        &'a self,
        key: &'a str,
        token: Self::Token,
        value: Vec<u8>,
        ttl: u32,
    ) -> BoxFuture<'a, Result<bool, Error>>;

    /// Unconditional write.
    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>, ttl: u32)
        -> BoxFuture<'a, Result<(), Error>>;

    /// Batched [`get`](Self::get); absent keys are omitted from the map.
    fn get_multi<'a>(
        &'a self,
        keys: &'a [String],
    ) -> BoxFuture<'a, Result<HashMap<String, Vec<u8>>, Error>>;

    /// Batched [`gets`](Self::gets); absent keys are omitted from the map.
    fn gets_multi<'a>(
        &'a self,
        keys: &'a [String],
    ) -> BoxFuture<'a, Result<HashMap<String, (Self::Token, Vec<u8>)>, Error>>;

    /// Batched [`add`](Self::add) with a per-key win/loss result.
    fn add_multi<'a>(
        &'a self,
        ops: Vec<AddOp>,
    ) -> BoxFuture<'a, Result<HashMap<String, bool>, Error>>;

    /// Batched [`cas`](Self::cas) with a per-key win/loss result.
    fn cas_multi<'a>(
        &'a self,
        ops: Vec<CasOp<Self::Token>>,
    ) -> BoxFuture<'a, Result<HashMap<String, bool>, Error>>;

    /// Batched [`set`](Self::set).
    fn set_multi<'a>(&'a self, ops: Vec<SetOp>) -> BoxFuture<'a, Result<(), Error>>;
}
