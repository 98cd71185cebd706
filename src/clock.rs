//! An injectable source of time.
//!
//! The C original installs a process-wide mutable `time_now` that test
//! code can override. We instead thread a [`Clock`] value through every
//! component that schedules a deadline (`xfrd`'s refresh/retry/expire
//! timers, the NOTIFY sender's retry timer, TSIG's fudge check), so that
//! tests can advance time deterministically without sleeping and without
//! any global mutable state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of the current wall-clock time, in seconds since the Unix epoch.
///
/// TSIG's fudge check and the journal's `serial_disk_acquired` bookkeeping
/// both want seconds-since-epoch rather than [`tokio::time::Instant`],
/// because they must match across process restarts and across peers on
/// the wire.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_secs(&self) -> u64;
}

/// The real clock, backed by [`SystemTime::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_secs()
    }
}

/// A clock that only advances when told to, for deterministic tests of
/// refresh/retry/expire timers and TSIG fudge boundaries.
#[derive(Debug, Clone)]
pub struct MockClock {
    now: Arc<AtomicU64>,
}

impl MockClock {
    pub fn new(start_secs: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_secs)),
        }
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, secs: u64) {
        self.now.store(secs, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_secs(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A shared, dynamically dispatched clock handle, cheap to clone and pass
/// into every component that needs to read the time.
pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_advances_on_command_only() {
        let clock = MockClock::new(1_000);
        assert_eq!(clock.now_secs(), 1_000);
        clock.advance(300);
        assert_eq!(clock.now_secs(), 1_300);
        clock.set(5);
        assert_eq!(clock.now_secs(), 5);
    }
}
