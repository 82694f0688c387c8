//! The coordinator: per-key state machine and its batched variant.
//!
//! Both entry points classify every observed key into one of four routes —
//! a fresh **hit**, a **wait** behind somebody else's lock, a **CAS
//! upgrade** of a stale value, or an **add attempt** on an absent key —
//! and then drive each route through the store's atomic primitives. The
//! compute callback runs only for keys this caller managed to lock.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::client::{AddOp, CasOp, MemcacheClient, SetOp};
use crate::clock::{Clock, SystemClock};
use crate::envelope::Envelope;
use crate::expiration::{lock_ttl, normalize, value_ttl};
use crate::waiter::{Wait, WaitMany};
use crate::Error;

/// Default upper bound on recomputation duration, and thus on the lifetime
/// of a lock whose holder dies.
pub const DEFAULT_COMPUTE_TIME: Duration = Duration::from_secs(2);

/// Routing outcome for one observed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// Fresh valued envelope: return the value.
    Hit,
    /// Somebody else holds the lock (live placeholder, or stale entry
    /// already flagged): fall through to the waiter.
    Wait,
    /// Stale and unclaimed: try to take the re-computation lock via CAS.
    CasUpgrade,
    /// Absent: try to take the first-insertion lock via `add`.
    Add,
}

fn classify<V>(envelope: Option<&Envelope<V>>, now: f64) -> Route {
    match envelope {
        None => Route::Add,
        Some(envelope) if envelope.is_fresh(now) => {
            if envelope.value.is_some() {
                Route::Hit
            } else {
                Route::Wait
            }
        }
        Some(envelope) if envelope.processing => Route::Wait,
        Some(_) => Route::CasUpgrade,
    }
}

/// Result of one pass of the single-key state machine.
enum SingleOutcome<V> {
    Resolved(V),
    Wait,
}

/// Result of the warm re-lock attempt.
enum Relock<V> {
    /// The CAS won; this caller computes.
    Locked,
    /// Somebody else got there first; wait.
    Lost,
    /// The race was won by a completed recomputation; use its value.
    Fresh(V),
    /// The entry vanished between `get` and `gets`; fall back to `add`.
    Absent,
}

/// Mediates the computation of expensive cached values so that a
/// near-synchronous fleet of callers cannot stampede the backing system.
///
/// Correctness rests entirely on the store's per-key atomicity of `add`
/// and `cas`; the cacher itself holds no locks and keeps no state beyond
/// its injected collaborators, so it can be shared freely across tasks.
pub struct Cacher<C> {
    client: C,
    clock: Arc<dyn Clock>,
}

impl<C> Cacher<C> {
    /// Creates a cacher over `client` using the system clock.
    pub fn new(client: C) -> Self {
        Self::with_clock(client, Arc::new(SystemClock))
    }

    /// Creates a cacher with an explicit clock, e.g. a virtual one in tests.
    pub fn with_clock(client: C, clock: Arc<dyn Clock>) -> Self {
        Cacher { client, clock }
    }

    /// The underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }
}

impl<C: MemcacheClient> Cacher<C> {
    /// Returns the value under `key`, computing it if necessary.
    ///
    /// `expiration` is the freshness window in seconds; values above 30
    /// days are interpreted as absolute Unix timestamps, mirroring
    /// Memcached's own TTL semantics. `compute_time` is the caller's upper
    /// bound on how long `compute` may take — it caps the lifetime of the
    /// lock, so a crashed holder stalls other callers by at most
    /// `ceil(compute_time)` seconds.
    ///
    /// Returns `Ok(None)` only when the default (or duration) waiter loses
    /// the race twice in a row; callbacks decide their own result.
    pub async fn get_or_compute<V, F, Fut>(
        &self,
        key: &str,
        expiration: f64,
        compute: F,
        compute_time: Duration,
        wait: Wait<V>,
    ) -> Result<Option<V>, Error>
    where
        V: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<V, Error>>,
    {
        let expiration = normalize(expiration, self.clock.now());
        let mut wait = Some(wait);
        loop {
            match self.single_round(key, expiration, &compute, compute_time).await? {
                SingleOutcome::Resolved(value) => return Ok(Some(value)),
                SingleOutcome::Wait => match wait.take() {
                    Some(Wait::Callback(callback)) => {
                        tracing::trace!(key, "lock race lost; yielding to waiter callback");
                        return callback().await;
                    }
                    Some(Wait::Duration(duration)) => {
                        tracing::trace!(key, ?duration, "lock race lost; sleeping before retry");
                        self.clock.sleep(duration).await;
                    }
                    Some(Wait::Default) => {
                        tracing::trace!(key, "lock race lost; sleeping before retry");
                        self.clock.sleep(compute_time).await;
                    }
                    None => {
                        tracing::trace!(key, "lock race lost again; giving up");
                        return Ok(None);
                    }
                },
            }
        }
    }

    /// One full pass of the per-key state machine: classify, lock, compute.
    async fn single_round<V, F, Fut>(
        &self,
        key: &str,
        expiration: f64,
        compute: &F,
        compute_time: Duration,
    ) -> Result<SingleOutcome<V>, Error>
    where
        V: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<V, Error>>,
    {
        let observed = match self.client.get(key).await? {
            Some(bytes) => Some(Envelope::<V>::from_bytes(&bytes)?),
            None => None,
        };

        let locked = match classify(observed.as_ref(), self.clock.now()) {
            Route::Hit => {
                tracing::trace!(key, "fresh hit");
                match observed.and_then(|envelope| envelope.value) {
                    Some(value) => return Ok(SingleOutcome::Resolved(value)),
                    None => return Ok(SingleOutcome::Wait),
                }
            }
            Route::Wait => false,
            Route::Add => self.try_add_lock(key, compute_time).await?,
            Route::CasUpgrade => match self.try_relock(key, compute_time).await? {
                Relock::Locked => true,
                Relock::Lost => false,
                Relock::Fresh(value) => return Ok(SingleOutcome::Resolved(value)),
                Relock::Absent => self.try_add_lock(key, compute_time).await?,
            },
        };

        if !locked {
            return Ok(SingleOutcome::Wait);
        }

        let value = compute().await?;
        let now = self.clock.now();
        let envelope = Envelope::fresh(now + expiration, &value);
        self.client
            .set(key, envelope.to_bytes()?, value_ttl(expiration, compute_time))
            .await?;
        tracing::trace!(key, soft_expiry = now + expiration, "computed and published");
        Ok(SingleOutcome::Resolved(value))
    }

    /// Cold lock: `add` a placeholder, winning iff the key is absent.
    async fn try_add_lock(&self, key: &str, compute_time: Duration) -> Result<bool, Error> {
        let placeholder = Envelope::placeholder().to_bytes()?;
        let won = self
            .client
            .add(key, placeholder, lock_ttl(compute_time))
            .await?;
        tracing::trace!(key, won, "first-insertion lock attempt");
        Ok(won)
    }

    /// Warm re-lock: `gets` for a token, then CAS the envelope to a
    /// placeholder. Re-reading anchors the decision — the earlier `get`'s
    /// view may already be stale-by-race.
    async fn try_relock<V: DeserializeOwned>(
        &self,
        key: &str,
        compute_time: Duration,
    ) -> Result<Relock<V>, Error> {
        let Some((token, bytes)) = self.client.gets(key).await? else {
            return Ok(Relock::Absent);
        };
        let envelope = Envelope::<V>::from_bytes(&bytes)?;
        match classify(Some(&envelope), self.clock.now()) {
            Route::Wait => return Ok(Relock::Lost),
            Route::Hit => {
                // A recomputation finished in between; its value is ours too.
                match envelope.value {
                    Some(value) => return Ok(Relock::Fresh(value)),
                    None => return Ok(Relock::Lost),
                }
            }
            Route::CasUpgrade => {}
            // classify never maps a present envelope to Add
            Route::Add => return Ok(Relock::Absent),
        }

        let placeholder = Envelope::placeholder().to_bytes()?;
        let won = self
            .client
            .cas(key, token, placeholder, lock_ttl(compute_time))
            .await?;
        tracing::trace!(key, won, "re-computation lock attempt");
        Ok(if won { Relock::Locked } else { Relock::Lost })
    }

    /// Batched form of [`get_or_compute`](Self::get_or_compute).
    ///
    /// Preserves the per-key state machine while driving every phase with
    /// a single batch round-trip: one `get_multi` to classify, one
    /// `gets_multi` plus one `cas_multi` for the stale keys, one
    /// `add_multi` for the absent ones, one compute invocation for all
    /// keys this caller locked, and one `set_multi` to publish.
    ///
    /// `compute` receives the locked keys and must return one value per
    /// key, in order. Keys for which the waiter gives up are absent from
    /// the returned map.
    ///
    /// Because `compute` runs once for all locked keys together, its
    /// duration can exceed the per-key `compute_time`; size `compute_time`
    /// to the cumulative cost. Batches are never split.
    pub async fn get_or_compute_many<V, F, Fut>(
        &self,
        keys: &[(String, f64)],
        compute: F,
        compute_time: Duration,
        wait: WaitMany<V>,
    ) -> Result<HashMap<String, V>, Error>
    where
        V: Serialize + DeserializeOwned,
        F: Fn(Vec<String>) -> Fut,
        Fut: Future<Output = Result<Vec<V>, Error>>,
    {
        let mut seen = HashSet::new();
        for (key, _) in keys {
            if !seen.insert(key.as_str()) {
                return Err(Error::invalid_argument(format!("duplicate key: {key:?}")));
            }
        }

        // Normalisation happens exactly once; retries reuse the relative
        // windows computed here.
        let now = self.clock.now();
        let mut pending: Vec<(String, f64)> = keys
            .iter()
            .map(|(key, expiration)| (key.clone(), normalize(*expiration, now)))
            .collect();

        let mut output = HashMap::new();
        let mut wait = Some(wait);
        loop {
            let waiting = self
                .multi_round(&mut output, &pending, &compute, compute_time)
                .await?;
            if waiting.is_empty() {
                return Ok(output);
            }
            match wait.take() {
                Some(WaitMany::Callback(callback)) => {
                    let waiting_keys: Vec<String> =
                        waiting.into_iter().map(|(key, _)| key).collect();
                    tracing::trace!(
                        waiting = waiting_keys.len(),
                        "lock races lost; yielding to waiter callback"
                    );
                    let resolved = callback(waiting_keys).await?;
                    output.extend(resolved);
                    return Ok(output);
                }
                Some(WaitMany::Duration(duration)) => {
                    tracing::trace!(waiting = waiting.len(), ?duration, "sleeping before retry");
                    self.clock.sleep(duration).await;
                }
                Some(WaitMany::Default) => {
                    tracing::trace!(waiting = waiting.len(), "sleeping before retry");
                    self.clock.sleep(compute_time).await;
                }
                None => {
                    tracing::trace!(waiting = waiting.len(), "lock races lost again; giving up");
                    return Ok(output);
                }
            }
            pending = waiting;
        }
    }

    /// One batched pass over `pending`: classify, CAS-upgrade, add,
    /// compute, publish. Resolved keys land in `output`; the
    /// still-waiting subset is returned for the waiter.
    async fn multi_round<V, F, Fut>(
        &self,
        output: &mut HashMap<String, V>,
        pending: &[(String, f64)],
        compute: &F,
        compute_time: Duration,
    ) -> Result<Vec<(String, f64)>, Error>
    where
        V: Serialize + DeserializeOwned,
        F: Fn(Vec<String>) -> Fut,
        Fut: Future<Output = Result<Vec<V>, Error>>,
    {
        let expirations: HashMap<&str, f64> = pending
            .iter()
            .map(|(key, expiration)| (key.as_str(), *expiration))
            .collect();
        let keys: Vec<String> = pending.iter().map(|(key, _)| key.clone()).collect();

        // Phase 1 — classify everything from one batched read.
        let mut found = self.client.get_multi(&keys).await?;
        let now = self.clock.now();

        let mut wait_keys: Vec<String> = Vec::new();
        let mut cas_keys: Vec<String> = Vec::new();
        let mut add_keys: Vec<String> = Vec::new();
        for key in keys {
            let envelope = match found.remove(&key) {
                Some(bytes) => Some(Envelope::<V>::from_bytes(&bytes)?),
                None => None,
            };
            match classify(envelope.as_ref(), now) {
                Route::Hit => {
                    if let Some(value) = envelope.and_then(|envelope| envelope.value) {
                        output.insert(key, value);
                    } else {
                        wait_keys.push(key);
                    }
                }
                Route::Wait => wait_keys.push(key),
                Route::CasUpgrade => cas_keys.push(key),
                Route::Add => add_keys.push(key),
            }
        }
        tracing::trace!(
            hits = output.len(),
            waits = wait_keys.len(),
            cas = cas_keys.len(),
            adds = add_keys.len(),
            "classified batch"
        );

        let placeholder = Envelope::placeholder().to_bytes()?;
        let mut compute_keys: Vec<String> = Vec::new();

        // Phase 2 — batched CAS upgrade of the stale keys. Runs before the
        // add attempts: a key evicted since phase 1 downgrades to the add
        // bucket and must ride the same add_multi.
        if !cas_keys.is_empty() {
            let mut tokens = self.client.gets_multi(&cas_keys).await?;
            let now = self.clock.now();
            let mut cas_ops: Vec<CasOp<C::Token>> = Vec::new();
            for key in cas_keys {
                let Some((token, bytes)) = tokens.remove(&key) else {
                    add_keys.push(key);
                    continue;
                };
                let envelope = Envelope::<V>::from_bytes(&bytes)?;
                match classify(Some(&envelope), now) {
                    Route::Hit => {
                        // Race won by a completed recomputation elsewhere.
                        if let Some(value) = envelope.value {
                            output.insert(key, value);
                        } else {
                            wait_keys.push(key);
                        }
                    }
                    Route::Wait => wait_keys.push(key),
                    Route::CasUpgrade => cas_ops.push(CasOp {
                        key,
                        token,
                        value: placeholder.clone(),
                        ttl: lock_ttl(compute_time),
                    }),
                    Route::Add => add_keys.push(key),
                }
            }
            if !cas_ops.is_empty() {
                let staged: Vec<String> = cas_ops.iter().map(|op| op.key.clone()).collect();
                let results = self.client.cas_multi(cas_ops).await?;
                for key in staged {
                    if results.get(&key).copied().unwrap_or(false) {
                        compute_keys.push(key);
                    } else {
                        wait_keys.push(key);
                    }
                }
            }
        }

        // Phase 3 — batched add attempt on everything absent.
        if !add_keys.is_empty() {
            let ops = add_keys
                .iter()
                .map(|key| AddOp {
                    key: key.clone(),
                    value: placeholder.clone(),
                    ttl: lock_ttl(compute_time),
                })
                .collect();
            let results = self.client.add_multi(ops).await?;
            for key in add_keys {
                if results.get(&key).copied().unwrap_or(false) {
                    compute_keys.push(key);
                } else {
                    wait_keys.push(key);
                }
            }
        }

        // Phase 4 — one compute invocation for every key we locked, then
        // one batched publish. Runs before the waiter so a retry observes
        // the fresh envelopes.
        if !compute_keys.is_empty() {
            tracing::trace!(computing = compute_keys.len(), "invoking compute callback");
            let values = compute(compute_keys.clone()).await?;
            if values.len() != compute_keys.len() {
                return Err(Error::invalid_argument(format!(
                    "compute callback returned {} values for {} keys",
                    values.len(),
                    compute_keys.len()
                )));
            }
            let now = self.clock.now();
            let mut set_ops = Vec::with_capacity(compute_keys.len());
            for (key, value) in compute_keys.iter().zip(&values) {
                let expiration = expirations[key.as_str()];
                let envelope = Envelope::fresh(now + expiration, value);
                set_ops.push(SetOp {
                    key: key.clone(),
                    value: envelope.to_bytes()?,
                    ttl: value_ttl(expiration, compute_time),
                });
            }
            self.client.set_multi(set_ops).await?;
            for (key, value) in compute_keys.into_iter().zip(values) {
                output.insert(key, value);
            }
        }

        Ok(wait_keys
            .into_iter()
            .map(|key| {
                let expiration = expirations[key.as_str()];
                (key, expiration)
            })
            .collect())
    }
}
