// rate_limit.rs — Per-user fixed-window counters.
//
// Each user gets one window: a counter and the instant the window opened.
// Once `window` has elapsed the counter starts over. The limit itself comes
// from the active policy (`security.maxAutoApprovalPerHour`) on every call,
// so a policy reload takes effect immediately.
//
// DashMap's entry guard makes check-and-increment atomic per user; two
// concurrent callers for the same user can never both take the last slot.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Counter for one user.
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    started: Instant,
}

/// Why a call was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitExceeded {
    pub limit: u32,
    /// Time until the user's window resets.
    pub retry_after: Duration,
}

pub struct RateLimiter {
    windows: DashMap<String, RateWindow>,
    window: Duration,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            window,
        }
    }

    /// Count one operation for `user`. Refused operations are not counted.
    ///
    /// Returns how many operations remain in the current window.
    pub fn check_and_record(&self, user: &str, limit: u32) -> Result<u32, RateLimitExceeded> {
        self.check_and_record_at(user, limit, Instant::now())
    }

    pub fn check_and_record_at(
        &self,
        user: &str,
        limit: u32,
        now: Instant,
    ) -> Result<u32, RateLimitExceeded> {
        let mut entry = self.windows.entry(user.to_string()).or_insert(RateWindow {
            count: 0,
            started: now,
        });
        if now.saturating_duration_since(entry.started) >= self.window {
            entry.count = 0;
            entry.started = now;
        }
        if entry.count >= limit {
            let retry_after = self
                .window
                .saturating_sub(now.saturating_duration_since(entry.started));
            return Err(RateLimitExceeded { limit, retry_after });
        }
        entry.count += 1;
        Ok(limit - entry.count)
    }

    /// Operations counted for `user` in the current window.
    pub fn current(&self, user: &str) -> u32 {
        self.windows.get(user).map(|w| w.count).unwrap_or(0)
    }

    /// Forget windows that have fully elapsed. Called from a background task.
    pub fn cleanup(&self) -> usize {
        let before = self.windows.len();
        let window = self.window;
        self.windows
            .retain(|_, w| w.started.elapsed() < window);
        before - self.windows.len()
    }

    pub fn tracked_users(&self) -> usize {
        self.windows.len()
    }
}
