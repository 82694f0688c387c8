//! End-to-end tests of the coordination protocol against the in-memory
//! mock client and virtual clock.

use std::collections::HashMap;
use std::future::{ready, Ready};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use herdcache::{Cacher, Envelope, Error, Wait, WaitMany, DEFAULT_COMPUTE_TIME};
use herdcache_test::{setup, MockClock, MockMemcache};

const START: f64 = 1_600_000_000.0;

fn fixture() -> (Arc<MockClock>, Cacher<MockMemcache>) {
    setup();
    let clock = Arc::new(MockClock::new(START));
    let cacher = Cacher::with_clock(MockMemcache::new(clock.clone()), clock.clone());
    (clock, cacher)
}

/// A compute callback that counts its invocations and resolves immediately.
fn counting(
    value: &'static str,
    counter: Arc<AtomicUsize>,
) -> impl Fn() -> Ready<Result<String, Error>> + Clone {
    move || {
        counter.fetch_add(1, Ordering::SeqCst);
        ready(Ok(value.to_string()))
    }
}

fn stored_envelope(client: &MockMemcache, key: &str) -> Envelope<String> {
    Envelope::from_bytes(&client.raw(key).expect("no live entry")).unwrap()
}

#[tokio::test]
async fn test_cold_single_insertion() -> Result<()> {
    let (_clock, cacher) = fixture();
    let computations = Arc::new(AtomicUsize::new(0));
    let compute = counting("V", computations.clone());

    let value = cacher
        .get_or_compute("k", 60.0, compute.clone(), DEFAULT_COMPUTE_TIME, Wait::Default)
        .await?;
    assert_eq!(value.as_deref(), Some("V"));
    assert_eq!(computations.load(Ordering::SeqCst), 1);

    let client = cacher.client();
    let envelope = stored_envelope(client, "k");
    assert!(!envelope.processing);
    assert_eq!(envelope.soft_expiry, START + 60.0);
    assert_eq!(envelope.value.as_deref(), Some("V"));
    assert_eq!(client.expires_at("k"), Some(START + 62.0));
    assert_eq!(client.ops.add.load(Ordering::SeqCst), 1);
    assert_eq!(client.ops.set.load(Ordering::SeqCst), 1);
    assert_eq!(client.ops.cas.load(Ordering::SeqCst), 0);

    // Eventually fresh: subsequent calls are plain hits.
    let again = cacher
        .get_or_compute("k", 60.0, compute, DEFAULT_COMPUTE_TIME, Wait::Default)
        .await?;
    assert_eq!(again.as_deref(), Some("V"));
    assert_eq!(computations.load(Ordering::SeqCst), 1);
    Ok(())
}

/// Two callers race on a cold key: one `add` wins, the loser sleeps and
/// picks up the winner's value on its retry. The compute callback runs in
/// exactly one of them.
#[tokio::test]
async fn test_concurrent_cold_race() -> Result<()> {
    let (_clock, cacher) = fixture();
    let computations = Arc::new(AtomicUsize::new(0));
    let compute = {
        let computations = computations.clone();
        move || {
            let computations = computations.clone();
            async move {
                computations.fetch_add(1, Ordering::SeqCst);
                // Suspend mid-computation so the second caller observes the
                // lock placeholder.
                tokio::task::yield_now().await;
                Ok::<_, Error>("fresh".to_string())
            }
        }
    };

    let winner = cacher.get_or_compute(
        "k",
        60.0,
        compute.clone(),
        DEFAULT_COMPUTE_TIME,
        Wait::Default,
    );
    let loser = cacher.get_or_compute(
        "k",
        60.0,
        compute,
        DEFAULT_COMPUTE_TIME,
        Wait::Duration(Duration::from_secs(1)),
    );
    let (winner, loser) = tokio::join!(winner, loser);

    assert_eq!(winner?.as_deref(), Some("fresh"));
    assert_eq!(loser?.as_deref(), Some("fresh"));
    assert_eq!(computations.load(Ordering::SeqCst), 1);
    assert_eq!(cacher.client().ops.add.load(Ordering::SeqCst), 1);
    Ok(())
}

/// A caller that loses twice in a row returns the empty result instead of
/// sleeping forever.
#[tokio::test]
async fn test_losing_caller_gives_up() -> Result<()> {
    let (_clock, cacher) = fixture();
    // A lock somebody else will hold for a long time.
    cacher
        .client()
        .seed_envelope("k", &Envelope::placeholder(), 600);

    let computations = Arc::new(AtomicUsize::new(0));
    let result = cacher
        .get_or_compute(
            "k",
            60.0,
            counting("unused", computations.clone()),
            DEFAULT_COMPUTE_TIME,
            Wait::Duration(Duration::from_secs(1)),
        )
        .await?;

    assert_eq!(result, None);
    assert_eq!(computations.load(Ordering::SeqCst), 0);
    // One initial pass plus exactly one retry.
    assert_eq!(cacher.client().ops.get.load(Ordering::SeqCst), 2);
    Ok(())
}

/// A soft-expired value is re-locked via `gets` + `cas` and recomputed,
/// while the entry keeps its afterlife TTL.
#[tokio::test]
async fn test_stale_serve_recomputation() -> Result<()> {
    let (_clock, cacher) = fixture();
    let client = cacher.client();
    client.seed_envelope("k", &Envelope::fresh(START - 1.0, "old".to_string()), 1);

    let computations = Arc::new(AtomicUsize::new(0));
    let value = cacher
        .get_or_compute(
            "k",
            60.0,
            counting("new", computations.clone()),
            DEFAULT_COMPUTE_TIME,
            Wait::Default,
        )
        .await?;
    assert_eq!(value.as_deref(), Some("new"));
    assert_eq!(computations.load(Ordering::SeqCst), 1);

    let envelope = stored_envelope(client, "k");
    assert!(!envelope.processing);
    assert_eq!(envelope.soft_expiry, START + 60.0);
    assert_eq!(envelope.value.as_deref(), Some("new"));
    assert_eq!(client.expires_at("k"), Some(START + 62.0));

    assert_eq!(client.ops.get.load(Ordering::SeqCst), 1);
    assert_eq!(client.ops.gets.load(Ordering::SeqCst), 1);
    assert_eq!(client.ops.cas.load(Ordering::SeqCst), 1);
    assert_eq!(client.ops.set.load(Ordering::SeqCst), 1);
    assert_eq!(client.ops.add.load(Ordering::SeqCst), 0);
    Ok(())
}

/// A reader landing between another caller's `cas` re-lock and its `set`
/// observes the lock placeholder and routes to the waiter.
#[tokio::test]
async fn test_reader_between_cas_and_set_waits() -> Result<()> {
    let (_clock, cacher) = fixture();
    cacher
        .client()
        .seed_envelope("k", &Envelope::fresh(START - 1.0, "old".to_string()), 10);

    let holder_computations = Arc::new(AtomicUsize::new(0));
    let holder_compute = {
        let computations = holder_computations.clone();
        move || {
            let computations = computations.clone();
            async move {
                computations.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Ok::<_, Error>("new".to_string())
            }
        }
    };

    let reader_computations = Arc::new(AtomicUsize::new(0));
    let holder =
        cacher.get_or_compute("k", 60.0, holder_compute, DEFAULT_COMPUTE_TIME, Wait::Default);
    let reader = cacher.get_or_compute(
        "k",
        60.0,
        counting("unused", reader_computations.clone()),
        DEFAULT_COMPUTE_TIME,
        Wait::Callback(Box::new(|| {
            Box::pin(async { Ok::<_, Error>(Some("waited".to_string())) })
        })),
    );
    let (holder, reader) = tokio::join!(holder, reader);

    assert_eq!(holder?.as_deref(), Some("new"));
    assert_eq!(reader?.as_deref(), Some("waited"));
    assert_eq!(holder_computations.load(Ordering::SeqCst), 1);
    assert_eq!(reader_computations.load(Ordering::SeqCst), 0);
    Ok(())
}

/// Expirations beyond 30 days are absolute epochs and are normalised to a
/// relative window before use.
#[tokio::test]
async fn test_expiration_as_epoch() -> Result<()> {
    let (_clock, cacher) = fixture();
    let computations = Arc::new(AtomicUsize::new(0));

    let value = cacher
        .get_or_compute(
            "k",
            START + 100.0,
            counting("V", computations.clone()),
            DEFAULT_COMPUTE_TIME,
            Wait::Default,
        )
        .await?;
    assert_eq!(value.as_deref(), Some("V"));

    let client = cacher.client();
    let envelope = stored_envelope(client, "k");
    assert_eq!(envelope.soft_expiry, START + 100.0);
    assert_eq!(client.expires_at("k"), Some(START + 102.0));
    Ok(())
}

/// A holder that crashed after `add` releases the key via TTL; the next
/// caller finds it absent and proceeds through the add path.
#[tokio::test]
async fn test_lock_expires_after_crash() -> Result<()> {
    let (clock, cacher) = fixture();
    cacher
        .client()
        .seed_envelope("k", &Envelope::placeholder(), 2);

    clock.advance(2.0);

    let computations = Arc::new(AtomicUsize::new(0));
    let value = cacher
        .get_or_compute(
            "k",
            60.0,
            counting("V", computations.clone()),
            DEFAULT_COMPUTE_TIME,
            Wait::Default,
        )
        .await?;
    assert_eq!(value.as_deref(), Some("V"));
    assert_eq!(computations.load(Ordering::SeqCst), 1);
    assert_eq!(cacher.client().ops.add.load(Ordering::SeqCst), 1);
    Ok(())
}

/// Scenario: one fresh key, one stale key, one locked key, one absent key,
/// in a single batched call. The compute callback runs once, for exactly
/// the locked subset, and every store phase issues one batch round-trip.
#[tokio::test]
async fn test_multi_mixed_outcomes() -> Result<()> {
    let (_clock, cacher) = fixture();
    let client = cacher.client();
    client.seed_envelope("k1", &Envelope::fresh(START + 10.0, "v1".to_string()), 100);
    client.seed_envelope("k2", &Envelope::fresh(START - 5.0, "old2".to_string()), 100);
    client.seed_envelope("k3", &Envelope::placeholder(), 100);
    // k4 is absent.

    let calls: Arc<Mutex<Vec<Vec<String>>>> = Arc::default();
    let compute = {
        let calls = calls.clone();
        move |keys: Vec<String>| {
            calls.lock().unwrap().push(keys.clone());
            let values = keys.iter().map(|key| format!("new-{key}")).collect();
            ready(Ok::<Vec<String>, Error>(values))
        }
    };

    let waited: Arc<Mutex<Vec<String>>> = Arc::default();
    let wait = WaitMany::Callback(Box::new({
        let waited = waited.clone();
        move |keys: Vec<String>| {
            waited.lock().unwrap().extend(keys.clone());
            Box::pin(async move {
                let resolved = keys
                    .into_iter()
                    .map(|key| (key, "waited".to_string()))
                    .collect();
                Ok::<HashMap<String, String>, Error>(resolved)
            })
        }
    }));

    let keys = vec![
        ("k1".to_string(), 10.0),
        ("k2".to_string(), 10.0),
        ("k3".to_string(), 10.0),
        ("k4".to_string(), 10.0),
    ];
    let values = cacher
        .get_or_compute_many(&keys, compute, DEFAULT_COMPUTE_TIME, wait)
        .await?;

    assert_eq!(values["k1"], "v1");
    assert_eq!(values["k2"], "new-k2");
    assert_eq!(values["k3"], "waited");
    assert_eq!(values["k4"], "new-k4");

    // Compute ran once, for exactly the locked keys.
    assert_eq!(calls.lock().unwrap().as_slice(), &[vec![
        "k2".to_string(),
        "k4".to_string()
    ]]);
    assert_eq!(waited.lock().unwrap().as_slice(), &["k3".to_string()]);

    // At most one of each batched operation, and no single-key traffic.
    assert_eq!(client.ops.get_multi.load(Ordering::SeqCst), 1);
    assert_eq!(client.ops.gets_multi.load(Ordering::SeqCst), 1);
    assert_eq!(client.ops.cas_multi.load(Ordering::SeqCst), 1);
    assert_eq!(client.ops.add_multi.load(Ordering::SeqCst), 1);
    assert_eq!(client.ops.set_multi.load(Ordering::SeqCst), 1);
    for count in [
        &client.ops.get,
        &client.ops.gets,
        &client.ops.add,
        &client.ops.cas,
        &client.ops.set,
    ] {
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    let envelope = stored_envelope(client, "k2");
    assert_eq!(envelope.soft_expiry, START + 10.0);
    assert_eq!(envelope.value.as_deref(), Some("new-k2"));
    assert_eq!(client.expires_at("k2"), Some(START + 12.0));
    Ok(())
}

/// The default multi-key waiter retries the waiting subset; keys whose
/// lock has expired by then are claimed and computed on the retry.
#[tokio::test]
async fn test_multi_retry_claims_expired_lock() -> Result<()> {
    let (_clock, cacher) = fixture();
    cacher
        .client()
        .seed_envelope("k", &Envelope::placeholder(), 1);

    let compute = |keys: Vec<String>| {
        let values = keys.iter().map(|key| format!("new-{key}")).collect();
        ready(Ok::<Vec<String>, Error>(values))
    };

    let keys = vec![("k".to_string(), 10.0)];
    let values = cacher
        .get_or_compute_many(
            &keys,
            compute,
            DEFAULT_COMPUTE_TIME,
            WaitMany::Duration(Duration::from_secs(1)),
        )
        .await?;

    assert_eq!(values["k"], "new-k");
    assert_eq!(cacher.client().ops.get_multi.load(Ordering::SeqCst), 2);
    Ok(())
}

/// Keys still locked after the single retry are absent from the result.
#[tokio::test]
async fn test_multi_gives_up_on_held_locks() -> Result<()> {
    let (_clock, cacher) = fixture();
    cacher
        .client()
        .seed_envelope("k", &Envelope::placeholder(), 600);

    let compute = |keys: Vec<String>| {
        let values = keys.iter().map(|key| format!("new-{key}")).collect();
        ready(Ok::<Vec<String>, Error>(values))
    };

    let keys = vec![("k".to_string(), 10.0)];
    let values = cacher
        .get_or_compute_many(
            &keys,
            compute,
            DEFAULT_COMPUTE_TIME,
            WaitMany::Duration(Duration::from_secs(1)),
        )
        .await?;

    assert!(values.is_empty());
    assert_eq!(cacher.client().ops.get_multi.load(Ordering::SeqCst), 2);
    Ok(())
}

/// For disjoint keys, the batched coordinator produces the same per-key
/// outcomes as independent single-key calls over the same cache state.
#[tokio::test]
async fn test_multi_matches_single_outcomes() -> Result<()> {
    fn seed(client: &MockMemcache) {
        client.seed_envelope("k1", &Envelope::fresh(START + 10.0, "v1".to_string()), 100);
        client.seed_envelope("k2", &Envelope::fresh(START - 5.0, "old2".to_string()), 100);
        client.seed_envelope("k3", &Envelope::placeholder(), 600);
        // k4 is absent.
    }
    let keys = ["k1", "k2", "k3", "k4"];

    let (_clock, singles) = fixture();
    seed(singles.client());
    let mut single_outcomes: HashMap<String, Option<String>> = HashMap::new();
    for key in keys {
        let outcome = singles
            .get_or_compute(
                key,
                10.0,
                move || ready(Ok::<_, Error>(format!("new-{key}"))),
                DEFAULT_COMPUTE_TIME,
                Wait::Duration(Duration::from_secs(1)),
            )
            .await?;
        single_outcomes.insert(key.to_string(), outcome);
    }

    let (_clock, batched) = fixture();
    seed(batched.client());
    let compute = |keys: Vec<String>| {
        let values = keys.iter().map(|key| format!("new-{key}")).collect();
        ready(Ok::<Vec<String>, Error>(values))
    };
    let batch_input: Vec<(String, f64)> =
        keys.iter().map(|key| (key.to_string(), 10.0)).collect();
    let batch_outcomes = batched
        .get_or_compute_many(
            &batch_input,
            compute,
            DEFAULT_COMPUTE_TIME,
            WaitMany::Duration(Duration::from_secs(1)),
        )
        .await?;

    for key in keys {
        assert_eq!(
            batch_outcomes.get(key),
            single_outcomes[key].as_ref(),
            "outcomes diverge for {key}"
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_transport_errors_propagate() -> Result<()> {
    let (_clock, cacher) = fixture();
    cacher.client().set_offline(true);

    let computations = Arc::new(AtomicUsize::new(0));
    let result = cacher
        .get_or_compute(
            "k",
            60.0,
            counting("V", computations.clone()),
            DEFAULT_COMPUTE_TIME,
            Wait::Default,
        )
        .await;

    assert!(matches!(result, Err(Error::Transport(_))));
    assert_eq!(computations.load(Ordering::SeqCst), 0);
    Ok(())
}

/// A failing compute leaves only the lock placeholder behind; its TTL
/// alone governs recovery.
#[tokio::test]
async fn test_compute_failure_leaves_placeholder() -> Result<()> {
    let (clock, cacher) = fixture();
    let compute = || {
        ready(Err::<String, Error>(Error::compute(std::io::Error::new(
            std::io::ErrorKind::Other,
            "backend down",
        ))))
    };

    let result = cacher
        .get_or_compute("k", 60.0, compute, DEFAULT_COMPUTE_TIME, Wait::Default)
        .await;
    assert!(matches!(result, Err(Error::Compute(_))));

    let client = cacher.client();
    assert_eq!(client.ops.set.load(Ordering::SeqCst), 0);
    let envelope = stored_envelope(client, "k");
    assert!(envelope.processing);
    assert_eq!(envelope.value, None);

    // The placeholder self-expires, degrading the key to absent.
    clock.advance(2.0);
    assert!(!client.contains("k"));
    Ok(())
}

#[tokio::test]
async fn test_non_envelope_value_is_codec_error() -> Result<()> {
    let (_clock, cacher) = fixture();
    cacher.client().seed_raw("k", b"not an envelope".to_vec(), 60);

    let result = cacher
        .get_or_compute(
            "k",
            60.0,
            || ready(Ok::<_, Error>("V".to_string())),
            DEFAULT_COMPUTE_TIME,
            Wait::Default,
        )
        .await;
    assert!(matches!(result, Err(Error::Codec(_))));
    Ok(())
}

#[tokio::test]
async fn test_duplicate_keys_rejected_before_network() -> Result<()> {
    let (_clock, cacher) = fixture();
    let compute = |keys: Vec<String>| {
        let values = keys.iter().map(|_| "v".to_string()).collect();
        ready(Ok::<Vec<String>, Error>(values))
    };

    let keys = vec![("k".to_string(), 10.0), ("k".to_string(), 10.0)];
    let result = cacher
        .get_or_compute_many(&keys, compute, DEFAULT_COMPUTE_TIME, WaitMany::Default)
        .await;

    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    assert_eq!(cacher.client().ops.get_multi.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_compute_result_length_mismatch() -> Result<()> {
    let (_clock, cacher) = fixture();
    let compute = |_keys: Vec<String>| ready(Ok::<Vec<String>, Error>(Vec::new()));

    let keys = vec![("k".to_string(), 10.0)];
    let result = cacher
        .get_or_compute_many(&keys, compute, DEFAULT_COMPUTE_TIME, WaitMany::Default)
        .await;

    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    // The misbehaving callback held the lock; nothing was published.
    assert_eq!(cacher.client().ops.set_multi.load(Ordering::SeqCst), 0);
    Ok(())
}
