use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 20,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RatePermit {
    pub granted_at: Instant,
}

/// Sliding-window limiter shared by every fetcher of a run.
///
/// At most `max_requests` permits are granted inside any rolling `window`, and a full
/// window's worth may be granted back to back. Waiters queue on the state mutex, which
/// tokio hands out in FIFO order, so admission is first-come-first-served. Dropping an
/// `acquire` future before it resolves never records a grant.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<WindowState>,
    penalty_until: StdMutex<Option<Instant>>,
    granted: AtomicU64,
}

#[derive(Debug, Default)]
struct WindowState {
    issued: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: RateLimitConfig {
                max_requests: config.max_requests.max(1),
                window: config.window,
            },
            state: Mutex::new(WindowState::default()),
            penalty_until: StdMutex::new(None),
            granted: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Waits until a request can be issued without exceeding the window budget.
    pub async fn acquire(&self) -> RatePermit {
        let mut state = self.state.lock().await;
        loop {
            let now = Instant::now();

            if let Some(until) = self.current_penalty() {
                if until > now {
                    debug!(wait_ms = (until - now).as_millis() as u64, "rate limiter penalty wait");
                    tokio::time::sleep_until(until).await;
                    continue;
                }
            }

            while let Some(front) = state.issued.front() {
                if now.duration_since(*front) >= self.config.window {
                    state.issued.pop_front();
                } else {
                    break;
                }
            }

            if state.issued.len() < self.config.max_requests as usize {
                state.issued.push_back(now);
                self.granted.fetch_add(1, Ordering::Relaxed);
                return RatePermit { granted_at: now };
            }

            let Some(oldest) = state.issued.front().copied() else {
                continue;
            };
            tokio::time::sleep_until(oldest + self.config.window).await;
        }
    }

    /// Backoff signal raised when the upstream answers 429: nobody is admitted until
    /// `delay` has passed. Overlapping penalties keep the later deadline.
    pub fn penalize(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut penalty = self.penalty_until.lock().unwrap_or_else(|e| e.into_inner());
        if penalty.map_or(true, |existing| existing < until) {
            *penalty = Some(until);
        }
    }

    pub fn granted(&self) -> u64 {
        self.granted.load(Ordering::Relaxed)
    }

    fn current_penalty(&self) -> Option<Instant> {
        *self.penalty_until.lock().unwrap_or_else(|e| e.into_inner())
    }
}
