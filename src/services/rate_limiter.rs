//! Rate Limiter - sliding-window limiter for the Kameo API
//!
//! Kameo enforces a global per-session budget of 60 requests per rolling
//! 60-second window and reports usage through `x-ratelimit-limit` /
//! `x-ratelimit-remaining` response headers.
//!
//! This module keeps a log of request start times so that at most `limit`
//! requests begin inside any window, not just inside fixed refill periods.
//! Server-reported remaining counts are adopted when they are lower than
//! the local view, and a 429 puts the limiter into a cooldown that delays
//! every caller.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Sliding log of request start times
struct WindowState {
    starts: VecDeque<Instant>,
    limit: usize,
    window: Duration,
    cooldown_until: Option<Instant>,
}

impl WindowState {
    fn new(limit: usize, window: Duration) -> Self {
        Self {
            starts: VecDeque::with_capacity(limit),
            limit,
            window,
            cooldown_until: None,
        }
    }

    /// Drop start times that have aged out of the window
    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.starts.front() {
            if front + self.window <= now {
                self.starts.pop_front();
            } else {
                break;
            }
        }
    }

    fn try_reserve(&mut self, now: Instant) -> bool {
        self.prune(now);
        if let Some(until) = self.cooldown_until {
            if now < until {
                return false;
            }
            self.cooldown_until = None;
        }
        if self.starts.len() < self.limit {
            self.starts.push_back(now);
            true
        } else {
            false
        }
    }

    /// Time until the next reservation could succeed
    fn time_until_available(&self, now: Instant) -> Duration {
        let cooldown_wait = self
            .cooldown_until
            .filter(|&until| until > now)
            .map(|until| until - now)
            .unwrap_or(Duration::ZERO);

        let window_wait = if self.starts.len() >= self.limit {
            self.starts
                .front()
                .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
                .unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        };

        cooldown_wait.max(window_wait)
    }
}

/// Sliding-window rate limiter shared by every API call path
pub struct RateLimiter {
    state: Arc<Mutex<WindowState>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(WindowState::new(limit, window))),
        }
    }

    /// Reserve a slot for one request, waiting if necessary.
    /// Returns true if we had to wait (i.e., were rate limited).
    pub async fn reserve(&self) -> bool {
        let mut waited = false;
        loop {
            let wait_time = {
                let mut s = self.state.lock().await;
                let now = Instant::now();
                if s.try_reserve(now) {
                    return waited;
                }
                s.time_until_available(now)
            };

            waited = true;
            debug!("Rate limiter: waiting {:?} for a request slot", wait_time);
            tokio::time::sleep(wait_time).await;
        }
    }

    /// Try to reserve a slot without waiting. Returns true if successful.
    pub async fn try_reserve(&self) -> bool {
        let mut s = self.state.lock().await;
        s.try_reserve(Instant::now())
    }

    /// Adopt the server's remaining-request count when it is lower than
    /// the local view. The narrowing is recorded as synthetic start
    /// entries, so it ages out of the log one window after observation.
    /// A higher server count never widens the local window.
    pub async fn observe_remaining(&self, remaining: u32) {
        let mut s = self.state.lock().await;
        let now = Instant::now();
        s.prune(now);

        let local_remaining = s.limit.saturating_sub(s.starts.len());
        let server_remaining = remaining as usize;
        if server_remaining < local_remaining {
            let debit = local_remaining - server_remaining;
            debug!(
                "Rate limiter: adopting server remaining {} (local view {})",
                server_remaining, local_remaining
            );
            for _ in 0..debit {
                s.starts.push_back(now);
            }
        }
    }

    /// Enter a cooldown after a 429. With no Retry-After hint the
    /// cooldown lasts one full window.
    pub async fn start_cooldown(&self, retry_after: Option<Duration>) {
        let mut s = self.state.lock().await;
        let pause = retry_after.unwrap_or(s.window);
        let until = Instant::now() + pause;
        // Keep the later deadline if a cooldown is already running
        if s.cooldown_until.map_or(true, |current| until > current) {
            s.cooldown_until = Some(until);
        }
        debug!("Rate limiter: cooling down for {:?}", pause);
    }

    /// Fraction of the window currently used (0.0 = idle, 1.0 = saturated)
    pub async fn utilization(&self) -> f64 {
        let mut s = self.state.lock().await;
        s.prune(Instant::now());
        s.starts.len() as f64 / s.limit as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reserve_succeeds_when_idle() {
        let limiter = RateLimiter::new(5, Duration::from_millis(250));
        assert!(!limiter.reserve().await);
        assert!(!limiter.reserve().await);
        assert!(limiter.try_reserve().await);
    }

    #[tokio::test]
    async fn test_never_more_than_limit_per_window() {
        let window = Duration::from_millis(200);
        let limiter = RateLimiter::new(2, window);

        let mut starts = Vec::new();
        for _ in 0..6 {
            limiter.reserve().await;
            starts.push(Instant::now());
        }

        // Any request and the one two slots later must be at least a full
        // window apart, otherwise three would share one window.
        for pair in starts.windows(3) {
            assert!(pair[2] - pair[0] >= window - Duration::from_millis(5));
        }
    }

    #[tokio::test]
    async fn test_quota_holds_under_concurrent_callers() {
        let limit = 4;
        let window = Duration::from_millis(100);
        let limiter = Arc::new(RateLimiter::new(limit, window));
        let starts = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            let starts = starts.clone();
            tasks.push(tokio::spawn(async move {
                limiter.reserve().await;
                starts.lock().await.push(Instant::now());
            }));
        }
        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }

        let mut starts = starts.lock().await.clone();
        starts.sort();
        for pair in starts.windows(limit + 1) {
            assert!(pair[limit] - pair[0] >= window - Duration::from_millis(5));
        }
    }

    #[tokio::test]
    async fn test_observe_remaining_narrows_window() {
        let limiter = RateLimiter::new(10, Duration::from_millis(200));
        limiter.reserve().await;
        limiter.reserve().await;

        limiter.observe_remaining(1).await;
        assert!(limiter.try_reserve().await);
        assert!(!limiter.try_reserve().await);

        // Synthetic entries age out after one window
        tokio::time::sleep(Duration::from_millis(220)).await;
        assert!(limiter.try_reserve().await);
    }

    #[tokio::test]
    async fn test_observe_remaining_never_widens() {
        let limiter = RateLimiter::new(3, Duration::from_millis(200));
        assert!(limiter.try_reserve().await);
        assert!(limiter.try_reserve().await);
        assert!(limiter.try_reserve().await);

        limiter.observe_remaining(10).await;
        assert!(!limiter.try_reserve().await);
    }

    #[tokio::test]
    async fn test_cooldown_delays_reserve() {
        let limiter = RateLimiter::new(5, Duration::from_millis(100));
        limiter.start_cooldown(Some(Duration::from_millis(150))).await;

        let before = Instant::now();
        let waited = limiter.reserve().await;
        assert!(waited);
        assert!(before.elapsed() >= Duration::from_millis(145));
    }
}
