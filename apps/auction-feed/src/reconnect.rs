//! Bounded exponential backoff for abnormal disconnects.

use std::time::Duration;

use tracing::{error, info};

/// What to do after an abnormal close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    attempts: u32,
    max_attempts: u32,
    base_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            base_delay,
        }
    }

    /// `base_delay * 2^(attempt - 1)`, saturating instead of overflowing.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    pub fn on_abnormal_close(&mut self) -> ReconnectDecision {
        if self.attempts >= self.max_attempts {
            error!(
                target = "auction_feed.reconnect",
                attempts = self.attempts,
                "max reconnect attempts reached"
            );
            return ReconnectDecision::Exhausted {
                attempts: self.attempts,
            };
        }
        self.attempts += 1;
        let delay = self.delay_for(self.attempts);
        info!(
            target = "auction_feed.reconnect",
            attempt = self.attempts,
            max_attempts = self.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay,
        }
    }

    /// Called on every successful open and on a manual reconnect.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
