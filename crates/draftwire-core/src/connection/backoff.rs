// Reconnect backoff policy.

use std::time::Duration;

use rand::Rng;

/// Flat delay the web client always waited between reconnects; the
/// exponential schedule never goes below it by default.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_JITTER: f64 = 0.2;

/// Bounded exponential backoff with proportional jitter.
///
/// Attempt `n` (1-based) waits `min(base * 2^(n-1), max)` plus up to
/// `jitter` of that again. `max_attempts: None` retries forever.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            jitter: DEFAULT_JITTER,
        }
    }
}

impl ReconnectPolicy {
    /// Constant delay, no jitter, no cap.
    pub fn flat(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            max_attempts: None,
            jitter: 0.0,
        }
    }

    /// Delay before the given attempt, without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
            .max(self.base_delay)
    }

    /// Delay before the given attempt, jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.jitter_fraction();
        if jitter == 0.0 {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range(0.0..=jitter);
        stretch(nominal, factor)
    }

    /// Longest delay any attempt can wait.
    pub fn max_window(&self) -> Duration {
        let ceiling = self.max_delay.max(self.base_delay);
        stretch(ceiling, self.jitter_fraction())
    }

    /// `jitter` limited to `0.0..=1.0`; NaN and infinities count as none.
    fn jitter_fraction(&self) -> f64 {
        if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

/// `delay` plus `factor` of itself, saturating at `Duration::MAX`.
fn stretch(delay: Duration, factor: f64) -> Duration {
    let extra = Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX);
    delay.saturating_add(extra)
}
