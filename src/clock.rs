use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in whole seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current wall-clock time in microseconds since the Unix epoch.
///
/// Signed because consumers compute differences, and the wall clock may be
/// adjusted backwards between two samples.
pub fn wall_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Counts driver ticks and fires every `period` calls.
///
/// The event loop runs at 1 Hz, so a period of N fires roughly every N
/// seconds without needing its own timer.
#[derive(Debug)]
pub struct Periodic {
    period: u32,
    count: u32,
}

impl Periodic {
    pub fn new(period: u32) -> Self {
        assert!(period > 0, "period must be positive");
        Self { period, count: 0 }
    }

    pub fn fire(&mut self) -> bool {
        self.count += 1;
        if self.count >= self.period {
            self.count = 0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periodic_fires_every_nth_call() {
        let mut p = Periodic::new(3);
        assert!(!p.fire());
        assert!(!p.fire());
        assert!(p.fire());
        assert!(!p.fire());
        assert!(!p.fire());
        assert!(p.fire());
    }

    #[test]
    fn periodic_with_period_one_always_fires() {
        let mut p = Periodic::new(1);
        assert!(p.fire());
        assert!(p.fire());
    }

    #[test]
    fn wall_clock_is_sane() {
        // 2020-01-01 as a lower bound; both clocks agree on the second.
        let secs = unix_now();
        assert!(secs > 1_577_836_800);
        let micros = wall_micros();
        assert!((micros / 1_000_000 - secs as i64).abs() <= 1);
    }
}
