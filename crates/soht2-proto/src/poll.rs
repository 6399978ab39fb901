//! Idle backoff between empty exchanges
//!
//! A client session counts consecutive exchanges that moved no bytes in either
//! direction and asks the strategy how long to wait before the next one. The
//! counter resets as soon as data flows, and `delay(0)` is always zero.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::debug;

/// Strategy selector used in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollStrategyType {
    Constant,
    Linear,
    #[default]
    Exponent,
}

/// Polling configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub strategy: PollStrategyType,
    /// Delay of the first idle round; the fixed delay for `constant`
    #[serde(with = "crate::duration_millis")]
    pub initial_delay: Duration,
    /// Upper bound for `linear` and `exponent`
    #[serde(with = "crate::duration_millis")]
    pub max_delay: Duration,
    /// Number of idle rounds per e-fold of the `exponent` curve
    pub factor: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            strategy: PollStrategyType::Exponent,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 5,
        }
    }
}

impl PollConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.factor == 0 {
            return Err("poll.factor must be at least 1".to_string());
        }
        if self.strategy != PollStrategyType::Constant && self.max_delay < self.initial_delay {
            return Err("poll.max_delay must not be less than poll.initial_delay".to_string());
        }
        Ok(())
    }
}

/// Poll strategy, resolved once from configuration
#[derive(Debug)]
pub enum PollStrategy {
    Constant { delay: Duration },
    Linear { initial_delay: Duration, max_delay: Duration },
    Exponent(ExponentPoll),
}

impl PollStrategy {
    pub fn constant(delay: Duration) -> Self {
        PollStrategy::Constant { delay }
    }

    pub fn linear(initial_delay: Duration, max_delay: Duration) -> Self {
        PollStrategy::Linear {
            initial_delay,
            max_delay,
        }
    }

    pub fn exponent(initial_delay: Duration, max_delay: Duration, factor: u32) -> Self {
        PollStrategy::Exponent(ExponentPoll::new(initial_delay, max_delay, factor))
    }

    pub fn from_config(config: &PollConfig) -> Self {
        match config.strategy {
            PollStrategyType::Constant => Self::constant(config.initial_delay),
            PollStrategyType::Linear => Self::linear(config.initial_delay, config.max_delay),
            PollStrategyType::Exponent => {
                Self::exponent(config.initial_delay, config.max_delay, config.factor)
            }
        }
    }

    /// Wait before the next exchange after `iteration` consecutive empty ones
    pub fn delay(&self, iteration: u32) -> Duration {
        if iteration == 0 {
            return Duration::ZERO;
        }
        match self {
            PollStrategy::Constant { delay } => *delay,
            PollStrategy::Linear {
                initial_delay,
                max_delay,
            } => initial_delay.saturating_mul(iteration).min(*max_delay),
            PollStrategy::Exponent(exponent) => exponent.delay(iteration),
        }
    }
}

/// `min(initial_delay * e^(iteration / factor), max_delay)`
///
/// Computed values are memoized per iteration. The first iteration reaching the
/// cap is remembered, so later iterations clamp without touching the curve.
#[derive(Debug)]
pub struct ExponentPoll {
    initial_delay: Duration,
    max_delay: Duration,
    factor: u32,
    delays: DashMap<u32, Duration>,
    saturated_at: AtomicU32,
}

impl ExponentPoll {
    pub fn new(initial_delay: Duration, max_delay: Duration, factor: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            factor: factor.max(1),
            delays: DashMap::new(),
            saturated_at: AtomicU32::new(u32::MAX),
        }
    }

    fn delay(&self, iteration: u32) -> Duration {
        if iteration >= self.saturated_at.load(Ordering::Relaxed) {
            return self.max_delay;
        }

        let delay = *self
            .delays
            .entry(iteration)
            .or_insert_with(|| self.compute(iteration));

        if delay >= self.max_delay {
            let previous = self.saturated_at.fetch_min(iteration, Ordering::Relaxed);
            if iteration < previous {
                debug!("Exponent poll saturates at iteration {}", iteration);
                self.delays.retain(|k, _| *k < iteration);
            }
            return self.max_delay;
        }
        delay
    }

    fn compute(&self, iteration: u32) -> Duration {
        let scale = (iteration as f64 / self.factor as f64).exp();
        let secs = self.initial_delay.as_secs_f64() * scale;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Iteration from which the delay is clamped, once it has been observed
    pub fn saturation_point(&self) -> Option<u32> {
        match self.saturated_at.load(Ordering::Relaxed) {
            u32::MAX => None,
            iteration => Some(iteration),
        }
    }
}
