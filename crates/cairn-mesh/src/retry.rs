//! Connection retry with capped exponential backoff
//!
//! The policy and state are pure; the caller decides how to wait. Time is
//! read through [`Clock`] so tests can drive it by hand.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Runtime clock; follows tokio's paused time in tests
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new(start: Instant) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    /// Total attempts, the first one included
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Wait after the `attempt`-th failure (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exp);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again once `at` is reached
    RetryAt { attempt: u32, delay: Duration, at: Instant },
    /// Attempts exhausted
    GiveUp { attempts: u32 },
}

/// Attempt bookkeeping for one peer
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
    next_at: Option<Instant>,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            next_at: None,
        }
    }

    /// Count a new attempt and return its number
    pub fn start_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.next_at = None;
        self.attempts
    }

    pub fn on_failure(&mut self, now: Instant) -> RetryDecision {
        if self.attempts >= self.policy.max_attempts {
            self.next_at = None;
            return RetryDecision::GiveUp {
                attempts: self.attempts,
            };
        }
        let delay = self.policy.delay_for(self.attempts);
        let at = now + delay;
        self.next_at = Some(at);
        RetryDecision::RetryAt {
            attempt: self.attempts + 1,
            delay,
            at,
        }
    }

    /// Whether a scheduled retry may start
    pub fn is_due(&self, now: Instant) -> bool {
        self.next_at.is_some_and(|at| now >= at)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for(4), Duration::from_secs(30));
        assert_eq!(policy.delay_for(40), Duration::from_secs(30));
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let clock = ManualClock::new(Instant::now());
        let mut state = RetryState::new(RetryPolicy::default());

        assert_eq!(state.start_attempt(), 1);
        let RetryDecision::RetryAt { attempt, delay, at } = state.on_failure(clock.now()) else {
            panic!("expected a retry");
        };
        assert_eq!(attempt, 2);
        assert_eq!(delay, Duration::from_secs(5));

        assert!(!state.is_due(clock.now()));
        clock.advance(Duration::from_secs(4));
        assert!(!state.is_due(clock.now()));
        clock.advance(Duration::from_secs(1));
        assert!(state.is_due(clock.now()));
        assert_eq!(at, clock.now());

        state.start_attempt();
        assert!(matches!(
            state.on_failure(clock.now()),
            RetryDecision::RetryAt { attempt: 3, .. }
        ));
        state.start_attempt();
        assert_eq!(
            state.on_failure(clock.now()),
            RetryDecision::GiveUp { attempts: 3 }
        );
    }

    #[test]
    fn test_reset_clears_attempts() {
        let mut state = RetryState::new(RetryPolicy::default());
        state.start_attempt();
        state.start_attempt();
        state.reset();
        assert_eq!(state.attempts(), 0);
        assert!(!state.is_due(Instant::now()));
    }

    #[test]
    fn test_single_attempt_policy_never_retries() {
        let mut state = RetryState::new(RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        });
        state.start_attempt();
        assert_eq!(
            state.on_failure(Instant::now()),
            RetryDecision::GiveUp { attempts: 1 }
        );
    }
}
