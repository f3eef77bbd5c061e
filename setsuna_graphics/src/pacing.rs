//! High-precision frame-pacing sleep.
//!
//! OS sleeps overshoot by scheduler quanta, which is far too coarse for
//! compositor wake-ups. The sleeper spends most of the wait in a coarse
//! `thread::sleep` and spins on the monotonic clock for the tail.

use std::time::{Duration, Instant};

/// How much of the tail is left to the spin loop.
const SPIN_MARGIN: Duration = Duration::from_millis(2);

pub struct PreciseSleeper {
    spin_margin: Duration,
}

impl PreciseSleeper {
    pub fn new() -> Self {
        Self {
            spin_margin: SPIN_MARGIN,
        }
    }

    /// Sleeps until `target`, returning immediately if it already passed.
    pub fn sleep_until(&self, target: Instant) {
        loop {
            let now = Instant::now();
            let Some(remaining) = target.checked_duration_since(now) else {
                return;
            };
            if remaining > self.spin_margin {
                std::thread::sleep(remaining - self.spin_margin);
            } else {
                break;
            }
        }
        while Instant::now() < target {
            std::hint::spin_loop();
        }
    }

    pub fn sleep_for(&self, duration: Duration) {
        self.sleep_until(Instant::now() + duration);
    }
}

impl Default for PreciseSleeper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wakes_close_to_the_target() {
        let sleeper = PreciseSleeper::new();
        let target = Instant::now() + Duration::from_millis(12);
        sleeper.sleep_until(target);
        let error = Instant::now().duration_since(target);
        // The sleeper aims within 250us; leave slack for loaded CI machines.
        assert!(error < Duration::from_millis(2), "woke {error:?} late");
    }

    #[test]
    fn past_targets_return_immediately() {
        let sleeper = PreciseSleeper::new();
        let start = Instant::now();
        sleeper.sleep_until(start - Duration::from_millis(5));
        assert!(start.elapsed() < Duration::from_millis(2));
    }
}
