//! Backoff between sessions with central
//!
//! The delay grows geometrically from `initial_backoff` up to `max_backoff`.
//! A session that completes its handshake resets the schedule, so only
//! consecutive failures count towards `max_attempts`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Consecutive failures tolerated before giving up (None = never give up)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let max_millis = self.max_backoff.as_millis() as f64;
        Duration::from_millis(millis.min(max_millis).max(0.0) as u64)
    }
}

#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Gave up after {attempts} consecutive failed attempts")]
    Exhausted { attempts: usize },
}

/// Tracks consecutive failures and sleeps between attempts
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    failures: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Count one more failure and return how long to wait before retrying
    pub fn next_delay(&mut self) -> Result<Duration, ReconnectError> {
        self.failures += 1;
        match self.config.max_attempts {
            Some(max) if self.failures > max => Err(ReconnectError::Exhausted { attempts: max }),
            _ => Ok(self.config.delay_for(self.failures)),
        }
    }

    /// Sleep for the next delay
    pub async fn wait(&mut self) -> Result<(), ReconnectError> {
        let delay = self.next_delay()?;
        debug!("Retrying in {:?} (attempt {})", delay, self.failures);
        tokio::time::sleep(delay).await;
        Ok(())
    }

    pub fn reset(&mut self) {
        if self.failures > 0 {
            debug!("Session established, clearing {} failed attempts", self.failures);
        }
        self.failures = 0;
    }

    pub fn failures(&self) -> usize {
        self.failures
    }
}
