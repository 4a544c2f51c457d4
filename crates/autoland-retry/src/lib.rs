//! Retry strategies and backoff for the autoland pipeline.
//!
//! Every external system the pipeline talks to (tracker, directory, VCS
//! remotes, the tree-status endpoint) fails transiently; this crate holds the
//! shared strategy configuration and a small executor that understands the
//! difference between errors worth another attempt and errors that are not.
//!
//! # Example
//!
//! ```
//! use autoland_retry::{RetryBudget, RetryStrategyConfig, calculate_delay};
//!
//! let config = RetryBudget::Transport.to_config();
//! let delay = calculate_delay(&config, 2);
//! assert!(delay.as_secs() <= config.max_delay.as_secs());
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Strategy type for spacing retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    /// No delay between retries.
    Immediate,
    /// Delay doubles each attempt.
    Exponential,
    /// Delay increases linearly each attempt.
    Linear,
    /// Same delay every attempt (default; matches the fixed sleeps the
    /// transport budgets use).
    #[default]
    Constant,
}

/// Predefined budgets for the pipeline's recurring retry shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryBudget {
    /// HTTP/LDAP transport calls: three attempts, five seconds apart.
    #[default]
    Transport,
    /// Clone/pull against a VCS remote: three attempts, five seconds apart.
    Clone,
    /// Backoff-heavy budget for endpoints known to fall over under load.
    Patient,
}

impl RetryBudget {
    pub fn to_config(&self) -> RetryStrategyConfig {
        match self {
            RetryBudget::Transport | RetryBudget::Clone => RetryStrategyConfig {
                strategy: RetryStrategyType::Constant,
                max_attempts: 3,
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(5),
                jitter: 0.0,
            },
            RetryBudget::Patient => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 6,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(120),
                jitter: 0.5,
            },
        }
    }
}

/// Configuration for a retry strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    #[serde(default)]
    pub strategy: RetryStrategyType,
    /// Maximum number of attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for backoff calculations.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    /// Cap on the computed delay.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor (0.0 = none, 0.5 = delay scaled by 0.5..1.5).
    #[serde(default)]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(120)
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        RetryBudget::Transport.to_config()
    }
}

impl RetryStrategyConfig {
    /// A constant-interval budget, the shape used for tree-closure waits.
    pub fn constant(max_attempts: u32, interval: Duration) -> Self {
        Self {
            strategy: RetryStrategyType::Constant,
            max_attempts,
            base_delay: interval,
            max_delay: interval,
            jitter: 0.0,
        }
    }
}

/// Calculate the delay before the next attempt (`attempt` is 1-indexed).
pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        RetryStrategyType::Immediate => Duration::ZERO,
        RetryStrategyType::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        RetryStrategyType::Linear => config.base_delay.saturating_mul(attempt),
        RetryStrategyType::Constant => config.base_delay,
    };

    let capped = delay.min(config.max_delay);

    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Jitter factor of 0.5 means delay * (0.5 to 1.5).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::Rng;

    let jitter_range = 2.0 * jitter;
    let mut rng = rand::thread_rng();
    let random_value: f64 = rng.r#gen();
    let random_factor = 1.0 - jitter + (random_value * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).round() as u64;
    Duration::from_millis(millis)
}

/// Runs a fallible operation under a strategy configuration.
pub struct RetryExecutor {
    config: RetryStrategyConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryStrategyConfig) -> Self {
        Self { config }
    }

    pub fn from_budget(budget: RetryBudget) -> Self {
        Self::new(budget.to_config())
    }

    /// Run `operation` until it succeeds or the attempt budget is exhausted.
    /// The operation receives the current attempt number (starting at 1).
    pub fn run<T, E, F>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
    {
        self.run_if(operation, |_| true)
    }

    /// Like [`run`](Self::run), but only errors for which `should_retry`
    /// returns true consume further attempts; a fatal error is returned
    /// immediately. This is the shape the pusher's escalation ladder and the
    /// transport clients share: retryable and fatal are distinct result
    /// kinds, not distinct exception types.
    pub fn run_if<T, E, F, P>(&self, mut operation: F, should_retry: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 1;

        loop {
            match operation(attempt) {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempt >= self.config.max_attempts || !should_retry(&e) {
                        return Err(e);
                    }

                    let delay = calculate_delay(&self.config, attempt);
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}
