use std::time::Instant;

/// One cumulative counter reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSample {
    pub counter_value: u64,
    pub timestamp: Instant,
}

/// Turns successive readings of a monotonically increasing counter into a
/// per-second rate.
///
/// A counter that goes backwards (reset, rollover) contributes no delta, so
/// the rate is never negative.
#[derive(Debug, Clone, Default)]
pub struct RateTracker {
    previous: Option<RateSample>,
}

impl RateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a new reading and return the rate since the previous one.
    ///
    /// The first reading only establishes the baseline and returns 0.
    pub fn update(&mut self, counter_value: u64, timestamp: Instant) -> f64 {
        let current = RateSample {
            counter_value,
            timestamp,
        };

        let rate = match self.previous {
            Some(previous) => {
                let delta = current.counter_value.saturating_sub(previous.counter_value);
                let elapsed = current
                    .timestamp
                    .saturating_duration_since(previous.timestamp)
                    .as_secs_f64();

                if elapsed > 0.0 {
                    delta as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        self.previous = Some(current);
        rate
    }

    /// Same as [`update`](Self::update), rounded down to whole units.
    pub fn update_u64(&mut self, counter_value: u64, timestamp: Instant) -> u64 {
        self.update(counter_value, timestamp) as u64
    }

    pub fn previous(&self) -> Option<RateSample> {
        self.previous
    }

    /// Forget the stored reading so the next update starts a new baseline.
    pub fn reset(&mut self) {
        self.previous = None;
    }
}
