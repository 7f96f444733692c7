use std::time::{SystemTime, UNIX_EPOCH};

/// A source of event timestamps.
///
/// Frames carry unix microseconds. Publishers default to wall-clock time; the
/// TSC-backed clock trades calibration at startup for a cheaper read.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current timestamp in microseconds since the UNIX epoch.
    fn now_us(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|ts| u64::try_from(ts.as_micros()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// A clock that anchors to `SystemTime` once and advances with `quanta` ticks.
///
/// Monotonic within a process; two processes may disagree by the anchoring skew.
#[derive(Debug, Clone)]
pub struct QuantaClock {
    clock: quanta::Clock,
    start_wall_us: u64,
    start_instant: quanta::Instant,
}

impl Default for QuantaClock {
    fn default() -> Self {
        let clock = quanta::Clock::new();
        let start_instant = clock.now();
        Self {
            clock,
            start_wall_us: SystemClock.now_us(),
            start_instant,
        }
    }
}

impl QuantaClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for QuantaClock {
    fn now_us(&self) -> u64 {
        let delta = self.clock.now().duration_since(self.start_instant);
        self.start_wall_us + delta.as_micros() as u64
    }
}
