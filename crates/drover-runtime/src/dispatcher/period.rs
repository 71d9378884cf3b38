use std::time::Duration;

use rand::Rng;

/// Picks heartbeat periods jittered around a base period so nodes sharing
/// one configuration do not beat in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct PeriodChooser {
    period: Duration,
    epsilon: Duration,
}

impl PeriodChooser {
    pub fn new(period: Duration, epsilon: Duration) -> Self {
        Self { period, epsilon }
    }

    /// Uniform sample from `[period - epsilon, period + epsilon]`.
    pub fn choose(&self) -> Duration {
        let low = self.period.saturating_sub(self.epsilon);
        let high = self.period.saturating_add(self.epsilon);
        if low == high {
            return low;
        }
        let nanos = rand::rng().random_range(low.as_nanos()..=high.as_nanos());
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}
