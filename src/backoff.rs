//! Delay strategies for the streaming retry driver

use rand::Rng;
use std::time::Duration;

/// How long to wait before restarting a failed stream.
#[derive(Debug, Clone)]
pub enum RetryBackoff {
    /// The same delay before every restart.
    Fixed { initial: Duration },
    /// `initial * 2^attempt`, where attempt counts completed failures from 0.
    Exponential { initial: Duration },
    /// Exponential base with uniform noise in `[0.75 * base, 1.25 * base]`
    /// to spread restarts from correlated failures.
    ExponentialJitter { initial: Duration },
}

impl RetryBackoff {
    pub fn fixed(initial: Duration) -> Self {
        RetryBackoff::Fixed { initial }
    }

    pub fn exponential(initial: Duration) -> Self {
        RetryBackoff::Exponential { initial }
    }

    pub fn exponential_jitter(initial: Duration) -> Self {
        RetryBackoff::ExponentialJitter { initial }
    }

    /// Delay before the restart following failed attempt `attempt` (0-indexed).
    pub fn delay(&self, attempt: usize) -> Duration {
        self.delay_with_rng(attempt, &mut rand::rng())
    }

    /// Same as [`delay`](Self::delay) with an explicit RNG, for deterministic tests.
    pub fn delay_with_rng<R: Rng>(&self, attempt: usize, rng: &mut R) -> Duration {
        match self {
            RetryBackoff::Fixed { initial } => *initial,
            RetryBackoff::Exponential { initial } => doubled(*initial, attempt),
            RetryBackoff::ExponentialJitter { initial } => {
                let base = doubled(*initial, attempt).as_millis() as u64;
                if base == 0 {
                    return Duration::ZERO;
                }
                let low = base.saturating_mul(3) / 4;
                let high = base.saturating_mul(5) / 4;
                Duration::from_millis(rng.random_range(low..=high))
            }
        }
    }
}

fn doubled(initial: Duration, attempt: usize) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(u32::MAX as usize) as u32);
    initial.checked_mul(factor).unwrap_or(Duration::from_secs(u64::MAX))
}
