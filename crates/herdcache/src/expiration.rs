//! Normalisation of Memcached's overloaded expiration argument.
//!
//! Memcached interprets a TTL larger than 30 days as an absolute Unix
//! timestamp rather than a relative duration. The coordinator normalises
//! every caller-supplied expiration to relative seconds exactly once per
//! call, before any network round-trip, so the rest of the protocol only
//! ever deals in relative windows.

use std::time::Duration;

/// Expirations above this value (30 days, in seconds) are absolute epochs.
const RELATIVE_LIMIT: f64 = 30.0 * 86_400.0;

/// Converts a caller-supplied expiration to relative seconds from `now`.
pub(crate) fn normalize(expiration: f64, now: f64) -> f64 {
    if expiration > RELATIVE_LIMIT {
        expiration - now
    } else {
        expiration
    }
}

/// Memcached-level TTL for a lock placeholder.
///
/// Bounds the worst-case stall when a lock holder dies without writing. A
/// literal TTL of 0 would mean "never expire" to Memcached, so the result
/// is clamped to at least one second.
pub(crate) fn lock_ttl(compute_time: Duration) -> u32 {
    (compute_time.as_secs_f64().ceil() as u32).max(1)
}

/// Memcached-level TTL for a valued envelope.
///
/// The soft-expired value stays readable for `lock_ttl` extra seconds so it
/// can be served to other readers while one holder recomputes.
pub(crate) fn value_ttl(expiration: f64, compute_time: Duration) -> u32 {
    expiration.max(0.0).ceil() as u32 + lock_ttl(compute_time)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: f64 = 1_600_000_000.0;

    #[test]
    fn test_relative_passthrough() {
        assert_eq!(normalize(0.0, NOW), 0.0);
        assert_eq!(normalize(100.0, NOW), 100.0);
        assert_eq!(normalize(2_592_000.0, NOW), 2_592_000.0);
    }

    #[test]
    fn test_absolute_epoch_converted() {
        assert_eq!(normalize(NOW + 100.0, NOW), 100.0);
        assert_eq!(normalize(2_592_000.1, NOW), 2_592_000.1 - NOW);
    }

    #[test]
    fn test_lock_ttl_rounds_up() {
        assert_eq!(lock_ttl(Duration::from_secs(2)), 2);
        assert_eq!(lock_ttl(Duration::from_millis(1500)), 2);
        assert_eq!(lock_ttl(Duration::from_millis(100)), 1);
        assert_eq!(lock_ttl(Duration::ZERO), 1);
    }

    #[test]
    fn test_value_ttl_extends_past_soft_expiry() {
        assert_eq!(value_ttl(60.0, Duration::from_secs(2)), 62);
        assert_eq!(value_ttl(0.5, Duration::from_secs(2)), 3);
        assert_eq!(value_ttl(-5.0, Duration::from_secs(2)), 2);
    }
}
