use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Nanosecond time source. Probe timestamps, NAT aging and RX-check deadlines
/// all read from it so tests can drive time by hand.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Monotonic clock with a process-wide epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        epoch().elapsed().as_nanos() as u64
    }
}

/// Clock advanced explicitly. Clones share the same time.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_nanos() as u64, Ordering::AcqRel);
    }

    pub fn set(&self, ns: u64) {
        self.now.store(ns, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

pub fn duration_ns(d: Duration) -> u64 {
    d.as_nanos().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock;
        let a = clock.now_ns();
        std::thread::sleep(Duration::from_millis(1));
        assert!(clock.now_ns() > a);
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.advance(Duration::from_micros(5));
        assert_eq!(other.now_ns(), 5_000);
        other.set(42);
        assert_eq!(clock.now_ns(), 42);
    }
}
