//! Circuit breaker state machine for outbound model calls.
//!
//! ```text
//! Closed ──failure × threshold──▶ Open(until = now + cooldown)
//!   ▲                                │
//!   └────────── success ◀── cooldown elapsed, call attempted
//! ```
//!
//! There is no half-open probe state. Once the cooldown elapses the next
//! call goes through normally; a success resets the counter, a failure
//! re-opens the breaker because the counter is still at or above threshold.
//!
//! The `*_at` variants take the current instant explicitly so transitions
//! are testable without sleeping.

use std::time::{Duration, Instant};

use thiserror::Error;

/// Returned by [`CircuitBreaker::check`] while the breaker is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("circuit open, retry in {retry_after:?}")]
pub struct CircuitOpen {
    pub retry_after: Duration,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    /// A `threshold` of 0 is treated as 1.
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            consecutive_failures: 0,
            open_until: None,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_open(&self) -> bool {
        self.is_open_at(Instant::now())
    }

    pub fn is_open_at(&self, now: Instant) -> bool {
        matches!(self.open_until, Some(until) if now < until)
    }

    /// Fail fast while open.
    pub fn check(&self) -> Result<(), CircuitOpen> {
        self.check_at(Instant::now())
    }

    pub fn check_at(&self, now: Instant) -> Result<(), CircuitOpen> {
        match self.open_until {
            Some(until) if now < until => Err(CircuitOpen {
                retry_after: until - now,
            }),
            _ => Ok(()),
        }
    }

    /// Any success fully closes the breaker.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.open_until = None;
    }

    /// Count a failed attempt. Returns `true` when this failure (re)opened
    /// the breaker.
    pub fn record_failure(&mut self) -> bool {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.threshold {
            self.open_until = Some(now + self.cooldown);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(20);

    #[test]
    fn test_starts_closed() {
        let b = CircuitBreaker::new(3, COOLDOWN);
        assert!(b.check().is_ok());
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[test]
    fn test_opens_at_threshold() {
        let t0 = Instant::now();
        let mut b = CircuitBreaker::new(3, COOLDOWN);
        assert!(!b.record_failure_at(t0));
        assert!(!b.record_failure_at(t0));
        assert!(b.check_at(t0).is_ok());
        assert!(b.record_failure_at(t0));

        let err = b.check_at(t0 + Duration::from_secs(5)).unwrap_err();
        assert_eq!(err.retry_after, Duration::from_secs(15));
        assert!(b.is_open_at(t0));
    }

    #[test]
    fn test_cooldown_elapses_then_failure_reopens() {
        let t0 = Instant::now();
        let mut b = CircuitBreaker::new(2, COOLDOWN);
        b.record_failure_at(t0);
        b.record_failure_at(t0);

        let later = t0 + COOLDOWN;
        assert!(b.check_at(later).is_ok());
        assert!(b.record_failure_at(later));
        assert!(b.check_at(later + Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_success_resets_counter() {
        let t0 = Instant::now();
        let mut b = CircuitBreaker::new(3, COOLDOWN);
        b.record_failure_at(t0);
        b.record_failure_at(t0);
        b.record_success();
        assert_eq!(b.consecutive_failures(), 0);

        // Full threshold is required again.
        assert!(!b.record_failure_at(t0));
        assert!(!b.record_failure_at(t0));
        assert!(b.check_at(t0).is_ok());
        assert!(b.record_failure_at(t0));
        assert!(b.check_at(t0).is_err());
    }

    #[test]
    fn test_success_after_cooldown_closes() {
        let t0 = Instant::now();
        let mut b = CircuitBreaker::new(1, COOLDOWN);
        b.record_failure_at(t0);
        assert!(b.is_open_at(t0));
        b.record_success();
        assert!(!b.is_open_at(t0));
    }

    #[test]
    fn test_zero_threshold_clamped() {
        let mut b = CircuitBreaker::new(0, COOLDOWN);
        assert_eq!(b.threshold(), 1);
        assert!(b.record_failure());
    }
}
