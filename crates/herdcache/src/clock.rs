//! Time and sleep, behind one injectable facade.
//!
//! The protocol needs two things from its environment: the current
//! wall-clock time with sub-second precision (soft expiries are absolute
//! Unix timestamps), and a cooperative sleep for the default waiter. Both
//! go through [`Clock`] so tests can substitute a virtual clock and drive
//! it manually.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;

/// A source of wall-clock time and cooperative sleep.
pub trait Clock: Send + Sync {
    /// Current wall-clock time in seconds since the Unix epoch.
    fn now(&self) -> f64;

    /// Suspends the calling task for the given duration.
    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()>;
}

/// The real clock: [`SystemTime`] plus [`tokio::time::sleep`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}
