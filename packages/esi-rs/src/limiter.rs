//! Error-budget rate limiter.
//!
//! The upstream grants a budget of tolerated error responses per time
//! window and reports the remaining budget on every response. One
//! `ErrorLimiter` exists per process; every outgoing call passes through
//! `acquire`, which delays progressively as the budget drains and blocks
//! outright once it is spent or an outage pause is in effect.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// How long to pause after observing an upstream 5xx.
const OUTAGE_PAUSE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct LimitState {
    remaining_errors: i32,
    reset_at: DateTime<Utc>,
    paused_until: Option<DateTime<Utc>>,
}

impl Default for LimitState {
    fn default() -> Self {
        Self {
            // Full budget until the first response tells us otherwise.
            remaining_errors: 100,
            reset_at: Utc::now(),
            paused_until: None,
        }
    }
}

/// Process-wide error-budget state. Only the upstream client mutates it.
#[derive(Debug, Default)]
pub struct ErrorLimiter {
    state: Mutex<LimitState>,
}

impl ErrorLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the gate opens.
    ///
    /// Hard gates (an outage pause, or a spent budget waiting on its reset)
    /// are slept through and re-checked, because the state may change while
    /// sleeping. The progressive curve delay is then served exactly once.
    pub async fn acquire(&self) {
        loop {
            let gate = {
                let state = self.state.lock().await;
                Self::gate_wait(&state, Utc::now())
            };
            match gate {
                None => break,
                Some(delay) => {
                    debug!(delay_ms = delay.as_millis() as u64, "rate limit gate closed, waiting");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let delay = {
            let state = self.state.lock().await;
            curve_delay(state.remaining_errors)
        };
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
    }

    /// Wait imposed by a hard gate, `None` when the gate is open.
    fn gate_wait(state: &LimitState, now: DateTime<Utc>) -> Option<Duration> {
        if let Some(until) = state.paused_until {
            if until > now {
                return Some(duration_until(now, until));
            }
        }

        // Budget exhausted: wait for the window to reset.
        if state.remaining_errors <= 1 && state.reset_at > now {
            return Some(duration_until(now, state.reset_at));
        }

        None
    }

    /// Replace the budget from response headers. Pausing kicks in when a
    /// response reports one or zero tolerated errors left.
    pub async fn update_from_headers(&self, remaining: i32, reset_in: Duration) {
        let mut state = self.state.lock().await;
        state.remaining_errors = remaining;
        state.reset_at = Utc::now() + chrono::Duration::from_std(reset_in).unwrap_or_else(|_| chrono::Duration::zero());
        if remaining <= 1 {
            warn!(remaining, reset_in_secs = reset_in.as_secs(), "error budget spent, pausing");
            state.paused_until = Some(state.reset_at);
        }
    }

    /// Record a transient upstream outage: pause all calls for 60 s.
    pub async fn note_outage(&self) {
        let mut state = self.state.lock().await;
        let until = Utc::now() + chrono::Duration::from_std(OUTAGE_PAUSE).unwrap_or_else(|_| chrono::Duration::zero());
        state.paused_until = Some(until);
        warn!(pause_secs = OUTAGE_PAUSE.as_secs(), "upstream outage, pausing");
    }

    /// Current remaining budget, for logging and tests.
    pub async fn remaining(&self) -> i32 {
        self.state.lock().await.remaining_errors
    }
}

/// Progressive per-call delay as the error budget drains.
fn curve_delay(remaining: i32) -> Duration {
    match remaining {
        r if r > 50 => Duration::ZERO,
        r if r > 25 => Duration::from_millis(100),
        r if r > 10 => Duration::from_millis(500),
        r if r > 5 => Duration::from_secs(1),
        r if r > 2 => Duration::from_secs(2),
        // <= 1 also hits the reset gate before this delay applies.
        _ => Duration::from_secs(5),
    }
}

fn duration_until(now: DateTime<Utc>, later: DateTime<Utc>) -> Duration {
    (later - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curve_matches_budget_tiers() {
        assert_eq!(curve_delay(100), Duration::ZERO);
        assert_eq!(curve_delay(51), Duration::ZERO);
        assert_eq!(curve_delay(50), Duration::from_millis(100));
        assert_eq!(curve_delay(26), Duration::from_millis(100));
        assert_eq!(curve_delay(25), Duration::from_millis(500));
        assert_eq!(curve_delay(11), Duration::from_millis(500));
        assert_eq!(curve_delay(10), Duration::from_secs(1));
        assert_eq!(curve_delay(6), Duration::from_secs(1));
        assert_eq!(curve_delay(5), Duration::from_secs(2));
        assert_eq!(curve_delay(3), Duration::from_secs(2));
        assert_eq!(curve_delay(2), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn full_budget_does_not_wait() {
        let limiter = ErrorLimiter::new();
        let before = tokio::time::Instant::now();
        limiter.acquire().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn spent_budget_blocks_until_reset() {
        let limiter = ErrorLimiter::new();
        limiter.update_from_headers(1, Duration::from_secs(5)).await;

        let before = tokio::time::Instant::now();
        limiter.acquire().await;
        // Must have slept through the remaining window.
        assert!(before.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn outage_pauses_subsequent_calls() {
        let limiter = ErrorLimiter::new();
        limiter.note_outage().await;

        let before = tokio::time::Instant::now();
        limiter.acquire().await;
        assert!(before.elapsed() >= Duration::from_secs(59));
    }

    #[tokio::test(start_paused = true)]
    async fn draining_budget_applies_curve_delay() {
        let limiter = ErrorLimiter::new();
        limiter.update_from_headers(20, Duration::from_secs(60)).await;

        let before = tokio::time::Instant::now();
        limiter.acquire().await;
        let elapsed = before.elapsed();
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_secs(1));
    }
}
