use crate::jobs::error_codes::ErrorCode;
use crate::jobs::model::ErrorClass;
use chrono::Duration;
use rand::Rng;

/// Message fragments that mark a failure as transient. Matched
/// case-insensitively against the handler's error message.
pub const TRANSIENT_PATTERNS: &[&str] = &[
    "fetch failed",
    "econnrefused",
    "connection refused",
    "etimedout",
    "timeout",
    "timed out",
    "429",
    "rate limit",
    "502",
    "503",
    "504",
    "circuit breaker",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random; 0 keeps delays exact.
    pub jitter_pct: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::seconds(30),
            max_delay: Duration::minutes(5),
            jitter_pct: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_pct: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter_pct: f64) -> Self {
        self.jitter_pct = jitter_pct.clamp(0.0, 1.0);
        self
    }

    /// `attempt` is the 1-based number of the attempt that just failed.
    pub fn decide(
        &self,
        attempt: i32,
        max_attempts: i32,
        class: ErrorClass,
        rng: &mut impl Rng,
    ) -> RetryDecision {
        if class != ErrorClass::Retryable || attempt > max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.jittered(self.delay_for(attempt), rng),
        }
    }

    /// min(base * 2^(attempt-1), max), without jitter.
    pub fn delay_for(&self, attempt: i32) -> Duration {
        let exp = (attempt.max(1) - 1) as u32;
        let base_ms = self.base_delay.num_milliseconds().max(0);
        let max_ms = self.max_delay.num_milliseconds().max(0);

        // 2^exp overflows long before any sane cap; let the cap handle it.
        let pow2 = 1_i64.checked_shl(exp).filter(|p| *p > 0).unwrap_or(i64::MAX);
        Duration::milliseconds(base_ms.saturating_mul(pow2).min(max_ms))
    }

    fn jittered(&self, delay: Duration, rng: &mut impl Rng) -> Duration {
        if self.jitter_pct <= 0.0 {
            return delay;
        }
        let ms = delay.num_milliseconds() as f64;
        let range = ms * self.jitter_pct;
        let jitter = rng.gen_range(-range..=range);
        let max_ms = self.max_delay.num_milliseconds();
        Duration::milliseconds(((ms + jitter).round() as i64).clamp(0, max_ms))
    }
}

/// Classify a handler failure. A known code wins; otherwise the message is
/// matched against [`TRANSIENT_PATTERNS`] and anything unmatched is permanent.
pub fn classify(code: &str, message: &str) -> ErrorClass {
    ErrorCode::parse(code)
        .known_class()
        .unwrap_or_else(|| classify_message(message))
}

pub fn classify_message(message: &str) -> ErrorClass {
    let msg = message.to_lowercase();
    if TRANSIENT_PATTERNS.iter().any(|p| msg.contains(p)) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Permanent
    }
}
