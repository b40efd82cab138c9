use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use tokio::sync::Mutex;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub headers: RateLimitHeaders,
}

/// Sliding-window limiter over the last minute, with a short-burst cap so
/// a caller cannot spend the whole minute budget at once.
#[derive(Debug)]
pub struct RateLimiter {
    per_minute: u32,
    burst: u32,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(per_minute: u32, burst: u32) -> Self {
        Self {
            per_minute: per_minute.max(1),
            burst: burst.max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let burst_window = Duration::from_secs(1);

        let mut guard = self.windows.lock().await;
        let window = guard.entry(key.to_string()).or_default();
        while window.front().is_some_and(|t| now.duration_since(*t) > WINDOW) {
            window.pop_front();
        }

        let recent_burst = window
            .iter()
            .rev()
            .take_while(|t| now.duration_since(**t) <= burst_window)
            .count() as u32;

        let allowed = (window.len() as u32) < self.per_minute && recent_burst < self.burst;
        if allowed {
            window.push_back(now);
        }

        let used = window.len() as u32;
        let remaining = self.per_minute.saturating_sub(used);
        let reset_seconds = if allowed {
            0
        } else {
            window
                .front()
                .map(|oldest| {
                    WINDOW
                        .saturating_sub(now.duration_since(*oldest))
                        .as_secs()
                        .max(1)
                })
                .unwrap_or(1)
        };

        RateLimitDecision {
            allowed,
            headers: RateLimitHeaders {
                limit: self.per_minute,
                remaining,
                reset_seconds,
            },
        }
    }
}
