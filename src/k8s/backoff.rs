//! Jittered exponential backoff.

use std::time::Duration;

use rand::prelude::*;

/// An exponential backoff which doubles on each step up to a fixed ceiling.
#[derive(Clone, Debug)]
pub struct Backoff {
    /// The current nominal interval.
    current: Duration,
    /// The ceiling of the nominal interval.
    max: Duration,
    /// The factor of the nominal interval by which each sample may deviate in either direction.
    jitter: f64,
}

impl Backoff {
    /// Create a new instance starting at `initial`.
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            current: initial.min(max),
            max,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// The current nominal interval.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Sample a jittered interval around the current nominal interval.
    pub fn jittered(&self) -> Duration {
        self.jittered_with(&mut rand::thread_rng())
    }

    /// Sample a jittered interval using the given RNG.
    ///
    /// The sample is uniform over `[current * (1 - jitter), current * (1 + jitter)]`.
    pub fn jittered_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.jitter == 0.0 {
            return self.current;
        }
        let factor = rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        self.current.mul_f64(factor)
    }

    /// Double the nominal interval, capped at the ceiling.
    pub fn advance(&mut self) {
        self.current = self.current.saturating_mul(2).min(self.max);
    }
}
