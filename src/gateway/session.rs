//! Per-connection wire session state.
//!
//! Every connection starts in `New`, must authenticate before anything else
//! is accepted (`AuthWait`), then serves multiplexed requests (`Ready`)
//! until the client or server closes it (`Closing` → `Closed`).

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    AuthWait,
    Ready,
    Closing,
    Closed,
}

/// A simple fixed-window token bucket: `max_requests` per `window`,
/// resetting the count when the window elapses rather than draining
/// continuously — matches the config's `max_requests`/`window_seconds`
/// shape directly.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            window_start: Instant::now(),
            count: 0,
        }
    }

    /// Returns true if the request is allowed and counts it; false if the
    /// connection is over its limit for the current window.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
        }
        if self.count >= self.max_requests {
            return false;
        }
        self.count += 1;
        true
    }
}

pub struct ConnectionState {
    pub state: SessionState,
    pub agent_id: Option<String>,
    pub rate_limiter: RateLimiter,
}

impl ConnectionState {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            state: SessionState::New,
            agent_id: None,
            rate_limiter: RateLimiter::new(max_requests, window),
        }
    }
}
