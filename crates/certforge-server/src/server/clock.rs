use std::time::Instant;

/// A trait for time sources that return a monotonic timestamp.
///
/// This abstraction allows the cache to run against a real monotonic timer in
/// production and a mocked time source in tests. The unit is **milliseconds**
/// relative to an arbitrary origin fixed at construction.
pub trait TimeSource: Send + Sync {
    /// Returns the current time in milliseconds since the clock's origin.
    fn current_millis(&self) -> u64;
}

/// A monotonic time source measuring milliseconds since its creation.
///
/// Backed by [`Instant`], so wall-clock adjustments (NTP, manual changes)
/// never move cache timestamps backwards.
#[derive(Clone, Copy, Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl TimeSource for MonotonicClock {
    fn current_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::TimeSource;
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    /// Manually advanced clock shared between a test and the code under test.
    #[derive(Clone, Default)]
    pub struct MockClock {
        millis: Arc<AtomicU64>,
    }

    impl MockClock {
        pub fn advance(&self, millis: u64) {
            self.millis.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl TimeSource for MockClock {
        fn current_millis(&self) -> u64 {
            self.millis.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_never_goes_backwards() {
        let clock = MonotonicClock::default();
        let mut last = clock.current_millis();
        for _ in 0..1_000 {
            let now = clock.current_millis();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn monotonic_clock_advances() {
        let clock = MonotonicClock::default();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(clock.current_millis() >= 5);
    }
}
