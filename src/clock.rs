use std::time::{SystemTime, UNIX_EPOCH};

// Exactly representable and several ulps wide at current epoch magnitudes.
const TICK: f64 = 1.0 / 1024.0;

/// Write clock: milliseconds since the Unix epoch, strictly increasing within
/// one process even when the wall clock stalls or steps backwards.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    last: f64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock { last: 0.0 }
    }

    /// Starts the clock after `floor`, typically the newest timestamp on disk.
    pub fn starting_after(floor: f64) -> Self {
        MonotonicClock { last: floor.max(0.0) }
    }

    pub fn last(&self) -> f64 {
        self.last
    }

    pub fn next(&mut self) -> f64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
            * 1000.0;
        let stamp = if now > self.last {
            now
        } else {
            self.last + TICK
        };
        self.last = stamp;
        stamp
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strictly_increasing() {
        let mut clock = MonotonicClock::new();
        let mut prev = clock.next();
        for _ in 0..10_000 {
            let ts = clock.next();
            assert!(ts > prev, "{} not after {}", ts, prev);
            prev = ts;
        }
    }

    #[test]
    fn test_starts_after_floor_in_the_future() {
        let far_future = 2.0e12;
        let mut clock = MonotonicClock::starting_after(far_future);
        let ts = clock.next();
        assert!(ts > far_future);
        assert_eq!(ts, far_future + TICK);
        assert!(clock.next() > ts);
    }
}
