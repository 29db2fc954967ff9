//! Per-connection sliding-window rate limiter.
//!
//! Two independent windows per connection — control messages and audio
//! frames — each a simple timestamp deque rather than a token bucket, so the
//! boundary behaviour in spec §8 ("exactly `limit` messages in a window
//! succeed") is exact rather than approximate. State lives entirely on the
//! connection's [`RateLimitState`]; nothing is shared, matching spec §5's
//! "Rate-limiter state: per connection, no sharing."

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

/// Tunable window length and budget for one of the two counters.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitRule {
    pub window: Duration,
    pub limit: usize,
}

impl RateLimitRule {
    pub fn new(window: Duration, limit: usize) -> Self {
        Self { window, limit }
    }
}

#[derive(Debug, Default)]
struct SlidingWindowCounter {
    timestamps: VecDeque<u64>,
}

impl SlidingWindowCounter {
    /// Record an attempt at `now_millis` and report whether it is within
    /// budget. Entries older than `window` are evicted first.
    fn try_acquire(&mut self, now_millis: u64, rule: &RateLimitRule) -> bool {
        let window_millis = rule.window.as_millis() as u64;
        let floor = now_millis.saturating_sub(window_millis);
        while matches!(self.timestamps.front(), Some(&t) if t <= floor) {
            self.timestamps.pop_front();
        }

        if self.timestamps.len() >= rule.limit {
            return false;
        }

        self.timestamps.push_back(now_millis);
        true
    }
}

/// Per-connection rate-limit state (spec §3, entity "RateLimitState"): two
/// sliding-window counters, control and audio, reset when the connection
/// closes (i.e. simply dropped along with the connection's state).
#[derive(Debug, Default)]
pub struct RateLimitState {
    control: Mutex<SlidingWindowCounter>,
    audio: Mutex<SlidingWindowCounter>,
}

impl RateLimitState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire_control(&self, now_millis: u64, rule: &RateLimitRule) -> bool {
        self.control.lock().try_acquire(now_millis, rule)
    }

    pub fn try_acquire_audio(&self, now_millis: u64, rule: &RateLimitRule) -> bool {
        self.audio.lock().try_acquire(now_millis, rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_limit_messages_succeed_then_limit_plus_one_fails() {
        let state = RateLimitState::new();
        let rule = RateLimitRule::new(Duration::from_secs(10), 3);
        assert!(state.try_acquire_control(1000, &rule));
        assert!(state.try_acquire_control(1001, &rule));
        assert!(state.try_acquire_control(1002, &rule));
        assert!(!state.try_acquire_control(1003, &rule));
    }

    #[test]
    fn window_slides_forward_and_frees_budget() {
        let state = RateLimitState::new();
        let rule = RateLimitRule::new(Duration::from_millis(1000), 2);
        assert!(state.try_acquire_control(0, &rule));
        assert!(state.try_acquire_control(100, &rule));
        assert!(!state.try_acquire_control(200, &rule));
        // Past the 1000ms window from t=0: that entry should be evicted.
        assert!(state.try_acquire_control(1001, &rule));
    }

    #[test]
    fn control_and_audio_windows_are_independent() {
        let state = RateLimitState::new();
        let control_rule = RateLimitRule::new(Duration::from_secs(10), 1);
        let audio_rule = RateLimitRule::new(Duration::from_secs(10), 1);
        assert!(state.try_acquire_control(0, &control_rule));
        assert!(!state.try_acquire_control(1, &control_rule));
        assert!(state.try_acquire_audio(1, &audio_rule));
    }
}
