use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

#[derive(Debug, Snafu, PartialEq)]
pub enum Error {
    #[snafu(display("jitter range is inverted: from {from:?} > to {to:?}"))]
    InvertedJitter { from: Duration, to: Duration },

    #[snafu(display("jitter range has a lower bound but no upper bound"))]
    OpenEndedJitter,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Constant,
    Linear,
    #[default]
    Exponential,
}

/// A validated jitter range. `{from: None, to: x}` means `[0, x]`; a lower
/// bound without an upper bound is rejected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jitter {
    pub from: Duration,
    pub to: Duration,
}

impl Jitter {
    pub fn new(from: Option<Duration>, to: Option<Duration>) -> Result<Self> {
        let jitter = match (from, to) {
            (Some(from), Some(to)) => {
                ensure!(from <= to, InvertedJitterSnafu { from, to });
                Jitter { from, to }
            }
            (None, Some(to)) => Jitter {
                from: Duration::ZERO,
                to,
            },
            (Some(_), None) => return OpenEndedJitterSnafu.fail(),
            (None, None) => Jitter {
                from: Duration::ZERO,
                to: Duration::ZERO,
            },
        };
        Ok(jitter)
    }

    /// Draw a uniform sample from `[from, to]`.
    #[must_use]
    pub fn sample(&self) -> Duration {
        if self.from == self.to {
            return self.from;
        }
        let span = self.to - self.from;
        let offset = rand::thread_rng().gen_range(0..=span.as_millis() as u64);
        self.from + Duration::from_millis(offset)
    }
}

/// A resolved retry policy attached to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Option<Duration>,
    pub jitter: Option<Jitter>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Exponential,
            base: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Some(Duration::from_secs(60)),
            jitter: None,
        }
    }
}

impl RetryPolicy {
    /// The delay to apply before the given retry attempt (0-based: attempt 0
    /// is the delay after the first failure). `min(cap, base *
    /// multiplier^attempt)` plus a uniform jitter sample.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as f64;
        let raw_ms = match self.backoff {
            Backoff::Constant => base_ms,
            Backoff::Linear => base_ms * f64::from(attempt + 1),
            Backoff::Exponential => base_ms * self.multiplier.powi(attempt as i32),
        };
        let mut delay = Duration::from_millis(raw_ms.min(u64::MAX as f64) as u64);
        if let Some(cap) = self.cap {
            delay = delay.min(cap);
        }
        if let Some(jitter) = &self.jitter {
            delay += jitter.sample();
        }
        delay
    }

    /// Whether another attempt remains after `attempt` failures.
    #[must_use]
    pub fn attempts_remaining(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}
