use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

// ============== Rate Limiter (Sliding Window) ==============

/// Process-wide sliding-window limiter for outbound completion calls.
///
/// `allow*` only prunes and answers; callers must `record*` after a `true`
/// result, otherwise the limiter has no effect.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    enabled: bool,
    max_requests: usize,
    window: Duration,
    window_log: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(enabled: bool, max_requests: u32, window: Duration) -> Self {
        Self {
            enabled,
            max_requests: max_requests as usize,
            window,
            window_log: VecDeque::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&mut self, now: Instant) -> bool {
        if !self.enabled {
            return true;
        }
        self.evict(now);
        self.window_log.len() < self.max_requests
    }

    pub fn record(&mut self) {
        self.record_at(Instant::now());
    }

    pub fn record_at(&mut self, now: Instant) {
        if self.enabled {
            self.window_log.push_back(now);
        }
    }

    /// How long until `allow_at` would return true again.
    pub fn retry_after_at(&mut self, now: Instant) -> Duration {
        if self.allow_at(now) {
            return Duration::ZERO;
        }
        // The window holds at least `max_requests` entries here; the slot frees
        // when the one at that distance from the back expires.
        let idx = self.window_log.len() - self.max_requests;
        match self.window_log.get(idx) {
            Some(&oldest) => (oldest + self.window).saturating_duration_since(now),
            None => self.window,
        }
    }

    /// Number of calls currently inside the window (after pruning).
    pub fn in_window_at(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.window_log.len()
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&front) = self.window_log.front() {
            if now.saturating_duration_since(front) >= self.window {
                self.window_log.pop_front();
            } else {
                break;
            }
        }
    }
}
