//! Helpers for testing the coordination protocol.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that
//!    all console output is captured by the test runner.
//!
//!  - [`MockClock`] and [`MockMemcache`] must share the same clock
//!    instance, otherwise TTL eviction in the mock store will not line up
//!    with the coordinator's view of time.
//!
//!  - [`MockClock::sleep`] yields to the runtime once before advancing
//!    virtual time. Concurrent tasks joined with `tokio::join!` therefore
//!    get a chance to make progress during a waiter sleep, which makes
//!    race interleavings deterministic in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;

use herdcache::{AddOp, CasOp, Clock, Envelope, Error, MemcacheClient, SetOp};

/// Setup the test environment.
///
/// Initializes logs: the logger only captures logs from the `herdcache`
/// crate and mutes all other output.
pub fn setup() {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt::fmt;

    fmt()
        .with_env_filter(EnvFilter::new("herdcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A manually driven wall clock.
///
/// `now` starts wherever the test puts it and only moves via [`advance`]
/// (or via sleeps, which advance by the slept duration).
///
/// [`advance`]: MockClock::advance
#[derive(Debug)]
pub struct MockClock {
    now: Mutex<f64>,
}

impl MockClock {
    /// Creates a clock frozen at `start` (Unix seconds).
    pub fn new(start: f64) -> Self {
        MockClock {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, seconds: f64) {
        *self.now.lock().unwrap() += seconds;
    }
}

impl Clock for MockClock {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.advance(duration.as_secs_f64());
        })
    }
}

/// Per-operation call counters, for asserting batching behavior.
#[derive(Debug, Default)]
pub struct OpCounts {
    pub get: AtomicUsize,
    pub gets: AtomicUsize,
    pub add: AtomicUsize,
    pub cas: AtomicUsize,
    pub set: AtomicUsize,
    pub get_multi: AtomicUsize,
    pub gets_multi: AtomicUsize,
    pub add_multi: AtomicUsize,
    pub cas_multi: AtomicUsize,
    pub set_multi: AtomicUsize,
}

#[derive(Debug, Clone)]
struct Entry {
    bytes: Vec<u8>,
    token: u64,
    /// Absolute eviction time; `None` for ttl 0 ("never expire").
    expires_at: Option<f64>,
}

/// An in-memory Memcached double.
///
/// Implements the full [`MemcacheClient`] contract: per-entry CAS tokens
/// that change on every write, and TTL eviction evaluated lazily against
/// the shared [`MockClock`]. Batch operations bump only their own counter
/// in [`OpCounts`], so `get_multi` is distinguishable from N `get`s.
pub struct MockMemcache {
    clock: Arc<MockClock>,
    entries: Mutex<HashMap<String, Entry>>,
    next_token: AtomicU64,
    offline: AtomicBool,
    /// Call counters, by operation.
    pub ops: OpCounts,
}

impl MockMemcache {
    /// Creates an empty store evicting against `clock`.
    pub fn new(clock: Arc<MockClock>) -> Self {
        MockMemcache {
            clock,
            entries: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            offline: AtomicBool::new(false),
            ops: OpCounts::default(),
        }
    }

    /// When offline, every operation fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Writes raw bytes directly into the store, bypassing counters.
    pub fn seed_raw(&self, key: impl Into<String>, bytes: Vec<u8>, ttl: u32) {
        let expires_at = self.expiry(ttl);
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().unwrap().insert(
            key.into(),
            Entry {
                bytes,
                token,
                expires_at,
            },
        );
    }

    /// Seeds an encoded envelope under `key`.
    pub fn seed_envelope<V: Serialize>(
        &self,
        key: impl Into<String>,
        envelope: &Envelope<V>,
        ttl: u32,
    ) {
        self.seed_raw(key, envelope.to_bytes().unwrap(), ttl);
    }

    /// The live bytes under `key`, if any.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();
        purge(&mut entries, key, now);
        entries.get(key).map(|entry| entry.bytes.clone())
    }

    /// The absolute eviction time of the live entry under `key`.
    pub fn expires_at(&self, key: &str) -> Option<f64> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();
        purge(&mut entries, key, now);
        entries.get(key).and_then(|entry| entry.expires_at)
    }

    /// Whether a live entry exists under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.raw(key).is_some()
    }

    fn expiry(&self, ttl: u32) -> Option<f64> {
        (ttl > 0).then(|| self.clock.now() + f64::from(ttl))
    }

    fn check_online(&self) -> Result<(), Error> {
        if self.offline.load(Ordering::SeqCst) {
            Err(Error::transport("mock memcached is offline"))
        } else {
            Ok(())
        }
    }

    fn fresh_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::SeqCst)
    }

    fn do_add(&self, entries: &mut HashMap<String, Entry>, op: AddOp, now: f64) -> bool {
        purge(entries, &op.key, now);
        if entries.contains_key(&op.key) {
            return false;
        }
        let expires_at = self.expiry(op.ttl);
        entries.insert(
            op.key,
            Entry {
                bytes: op.value,
                token: self.fresh_token(),
                expires_at,
            },
        );
        true
    }

    fn do_cas(&self, entries: &mut HashMap<String, Entry>, op: CasOp<u64>, now: f64) -> bool {
        purge(entries, &op.key, now);
        match entries.get_mut(&op.key) {
            Some(entry) if entry.token == op.token => {
                entry.bytes = op.value;
                entry.token = self.fresh_token();
                entry.expires_at = self.expiry(op.ttl);
                true
            }
            _ => false,
        }
    }

    fn do_set(&self, entries: &mut HashMap<String, Entry>, op: SetOp) {
        let expires_at = self.expiry(op.ttl);
        entries.insert(
            op.key,
            Entry {
                bytes: op.value,
                token: self.fresh_token(),
                expires_at,
            },
        );
    }
}

fn purge(entries: &mut HashMap<String, Entry>, key: &str, now: f64) {
    let expired = entries
        .get(key)
        .is_some_and(|entry| entry.expires_at.is_some_and(|at| now >= at));
    if expired {
        entries.remove(key);
    }
}

impl MemcacheClient for MockMemcache {
    type Token = u64;

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, Error>> {
        Box::pin(async move {
            self.ops.get.fetch_add(1, Ordering::SeqCst);
            self.check_online()?;
            let now = self.clock.now();
            let mut entries = self.entries.lock().unwrap();
            purge(&mut entries, key, now);
            Ok(entries.get(key).map(|entry| entry.bytes.clone()))
        })
    }

    fn gets<'a>(
        &'a self,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<(u64, Vec<u8>)>, Error>> {
        Box::pin(async move {
            self.ops.gets.fetch_add(1, Ordering::SeqCst);
            self.check_online()?;
            let now = self.clock.now();
            let mut entries = self.entries.lock().unwrap();
            purge(&mut entries, key, now);
            Ok(entries
                .get(key)
                .map(|entry| (entry.token, entry.bytes.clone())))
        })
    }

    fn add<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: u32,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move {
            self.ops.add.fetch_add(1, Ordering::SeqCst);
            self.check_online()?;
            let now = self.clock.now();
            let mut entries = self.entries.lock().unwrap();
            let op = AddOp {
                key: key.to_owned(),
                value,
                ttl,
            };
            Ok(self.do_add(&mut entries, op, now))
        })
    }

    fn cas<'a>(
        &'a self,
        key: &'a str,
        token: u64,
        value: Vec<u8>,
        ttl: u32,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move {
            self.ops.cas.fetch_add(1, Ordering::SeqCst);
            self.check_online()?;
            let now = self.clock.now();
            let mut entries = self.entries.lock().unwrap();
            let op = CasOp {
                key: key.to_owned(),
                token,
                value,
                ttl,
            };
            Ok(self.do_cas(&mut entries, op, now))
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: u32,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.ops.set.fetch_add(1, Ordering::SeqCst);
            self.check_online()?;
            let mut entries = self.entries.lock().unwrap();
            self.do_set(
                &mut entries,
                SetOp {
                    key: key.to_owned(),
                    value,
                    ttl,
                },
            );
            Ok(())
        })
    }

    fn get_multi<'a>(
        &'a self,
        keys: &'a [String],
    ) -> BoxFuture<'a, Result<HashMap<String, Vec<u8>>, Error>> {
        Box::pin(async move {
            self.ops.get_multi.fetch_add(1, Ordering::SeqCst);
            self.check_online()?;
            let now = self.clock.now();
            let mut entries = self.entries.lock().unwrap();
            let mut found = HashMap::new();
            for key in keys {
                purge(&mut entries, key, now);
                if let Some(entry) = entries.get(key) {
                    found.insert(key.clone(), entry.bytes.clone());
                }
            }
            Ok(found)
        })
    }

    fn gets_multi<'a>(
        &'a self,
        keys: &'a [String],
    ) -> BoxFuture<'a, Result<HashMap<String, (u64, Vec<u8>)>, Error>> {
        Box::pin(async move {
            self.ops.gets_multi.fetch_add(1, Ordering::SeqCst);
            self.check_online()?;
            let now = self.clock.now();
            let mut entries = self.entries.lock().unwrap();
            let mut found = HashMap::new();
            for key in keys {
                purge(&mut entries, key, now);
                if let Some(entry) = entries.get(key) {
                    found.insert(key.clone(), (entry.token, entry.bytes.clone()));
                }
            }
            Ok(found)
        })
    }

    fn add_multi<'a>(
        &'a self,
        ops: Vec<AddOp>,
    ) -> BoxFuture<'a, Result<HashMap<String, bool>, Error>> {
        Box::pin(async move {
            self.ops.add_multi.fetch_add(1, Ordering::SeqCst);
            self.check_online()?;
            let now = self.clock.now();
            let mut entries = self.entries.lock().unwrap();
            let mut results = HashMap::new();
            for op in ops {
                let key = op.key.clone();
                let won = self.do_add(&mut entries, op, now);
                results.insert(key, won);
            }
            Ok(results)
        })
    }

    fn cas_multi<'a>(
        &'a self,
        ops: Vec<CasOp<u64>>,
    ) -> BoxFuture<'a, Result<HashMap<String, bool>, Error>> {
        Box::pin(async move {
            self.ops.cas_multi.fetch_add(1, Ordering::SeqCst);
            self.check_online()?;
            let now = self.clock.now();
            let mut entries = self.entries.lock().unwrap();
            let mut results = HashMap::new();
            for op in ops {
                let key = op.key.clone();
                let won = self.do_cas(&mut entries, op, now);
                results.insert(key, won);
            }
            Ok(results)
        })
    }

    fn set_multi<'a>(&'a self, ops: Vec<SetOp>) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.ops.set_multi.fetch_add(1, Ordering::SeqCst);
            self.check_online()?;
            let mut entries = self.entries.lock().unwrap();
            for op in ops {
                self.do_set(&mut entries, op);
            }
            Ok(())
        })
    }
}
