/*!
 * Host timing primitives.
 *
 * The bus layer only needs two things from the host: how long the process
 * has been running, and a way to block for a while. Both are behind the
 * [`Clock`] trait so tests can drive time by hand.
 */
use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Elapsed-time source and blocking wait
pub trait Clock: Debug {
    /// Time elapsed since process start
    fn elapsed(&self) -> Duration;

    /// Block the calling thread for `duration`
    fn sleep(&self, duration: Duration);
}

/// Wall clock anchored at construction.
///
/// Create it once at startup so `elapsed` approximates process uptime.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    /// Create a clock anchored at the current instant
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Create a clock anchored at an earlier instant
    pub fn since(start: Instant) -> Self {
        Self { start }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Default)]
struct ManualState {
    now: Duration,
    sleeps: Vec<Duration>,
}

/// Deterministic clock whose `sleep` advances time instantly.
///
/// Clones share the same timeline, so a test can keep one copy while the
/// bus context owns another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    state: Rc<RefCell<ManualState>>,
}

impl ManualClock {
    /// Create a clock at time zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock that has already been running for `now`
    pub fn starting_at(now: Duration) -> Self {
        let clock = Self::new();
        clock.state.borrow_mut().now = now;
        clock
    }

    /// Move time forward without recording a sleep
    pub fn advance(&self, by: Duration) {
        self.state.borrow_mut().now += by;
    }

    /// Every duration passed to `sleep`, in call order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.borrow().sleeps.clone()
    }
}

impl Clock for ManualClock {
    fn elapsed(&self) -> Duration {
        self.state.borrow().now
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.state.borrow_mut();
        state.now += duration;
        state.sleeps.push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock::new();
        let first = clock.elapsed();
        clock.sleep(Duration::from_millis(2));
        assert!(clock.elapsed() >= first + Duration::from_millis(2));
    }

    #[test]
    fn test_manual_clock_shares_timeline() {
        let clock = ManualClock::starting_at(Duration::from_millis(30));
        let other = clock.clone();

        other.sleep(Duration::from_millis(70));
        clock.advance(Duration::from_millis(5));

        assert_eq!(clock.elapsed(), Duration::from_millis(105));
        assert_eq!(other.elapsed(), Duration::from_millis(105));
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(70)]);
    }
}
