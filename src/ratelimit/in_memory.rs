use std::{
    collections::VecDeque,
    sync::Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::{
    sync::Mutex,
    time::Instant,
};

use crate::{
    error::GatewayResult,
    ratelimit::{
        RateLimitAlgorithm,
        RateLimitBackend,
        RateLimitDecision,
        RateLimitRule,
        ceil_secs,
    },
};

/// Process-local counter table. Each (rule, key) pair owns its own lock, so
/// distinct identities never contend with each other.
pub struct InMemoryRateLimitBackend {
    algorithm: RateLimitAlgorithm,
    state: DashMap<CounterKey, Arc<Mutex<RateLimitState>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CounterKey {
    rule: String,
    key: String,
}

enum RateLimitState {
    FixedWindow(FixedWindowState),
    SlidingWindow(SlidingWindowState),
}

struct FixedWindowState {
    window_start: Instant,
    count: u64,
    window: std::time::Duration,
}

struct SlidingWindowState {
    entries: VecDeque<Instant>,
    window: std::time::Duration,
}

impl RateLimitState {
    fn is_expired(&self, now: Instant) -> bool {
        match self {
            Self::FixedWindow(s) => now.duration_since(s.window_start) >= s.window,
            Self::SlidingWindow(s) => s
                .entries
                .back()
                .is_none_or(|last| now.duration_since(*last) >= s.window),
        }
    }
}

impl InMemoryRateLimitBackend {
    pub fn new(algorithm: RateLimitAlgorithm) -> Self {
        Self {
            algorithm,
            state: DashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.state.len()
    }

    fn entry_for(&self, key: &str, rule: &RateLimitRule) -> Arc<Mutex<RateLimitState>> {
        let counter_key = CounterKey {
            rule: rule.id().to_string(),
            key: key.to_string(),
        };

        self.state
            .entry(counter_key)
            .or_insert_with(|| {
                Arc::new(Mutex::new(match self.algorithm {
                    RateLimitAlgorithm::FixedWindow => {
                        RateLimitState::FixedWindow(FixedWindowState {
                            window_start: Instant::now(),
                            count: 0,
                            window: rule.window,
                        })
                    }
                    RateLimitAlgorithm::SlidingWindow => {
                        RateLimitState::SlidingWindow(SlidingWindowState {
                            entries: VecDeque::new(),
                            window: rule.window,
                        })
                    }
                }))
            })
            .clone()
    }
}

#[async_trait]
impl RateLimitBackend for InMemoryRateLimitBackend {
    async fn check(&self, key: &str, rule: &RateLimitRule) -> GatewayResult<RateLimitDecision> {
        let state = self.entry_for(key, rule);
        let mut state = state.lock().await;
        let now = Instant::now();

        match &mut *state {
            RateLimitState::FixedWindow(window) => {
                window.window = rule.window;
                if now.duration_since(window.window_start) >= rule.window {
                    window.window_start = now;
                    window.count = 0;
                }

                window.count += 1;
                if window.count > rule.quota {
                    let resets_in = rule
                        .window
                        .saturating_sub(now.duration_since(window.window_start));
                    Ok(RateLimitDecision {
                        allowed: false,
                        remaining: 0,
                        retry_after_secs: ceil_secs(resets_in),
                    })
                } else {
                    Ok(RateLimitDecision {
                        allowed: true,
                        remaining: rule.quota - window.count,
                        retry_after_secs: 0,
                    })
                }
            }
            RateLimitState::SlidingWindow(window) => {
                window.window = rule.window;
                while let Some(front) = window.entries.front() {
                    if now.duration_since(*front) >= rule.window {
                        window.entries.pop_front();
                    } else {
                        break;
                    }
                }

                if (window.entries.len() as u64) < rule.quota {
                    window.entries.push_back(now);
                    Ok(RateLimitDecision {
                        allowed: true,
                        remaining: rule.quota.saturating_sub(window.entries.len() as u64),
                        retry_after_secs: 0,
                    })
                } else {
                    let retry = window
                        .entries
                        .front()
                        .map(|t| ceil_secs(rule.window.saturating_sub(now.duration_since(*t))))
                        .unwrap_or_else(|| ceil_secs(rule.window));

                    Ok(RateLimitDecision {
                        allowed: false,
                        remaining: 0,
                        retry_after_secs: retry,
                    })
                }
            }
        }
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.state.len();

        // Entries locked by an in-flight check are live by definition.
        self.state.retain(|_, entry| match entry.try_lock() {
            Ok(state) => !state.is_expired(now),
            Err(_) => true,
        });

        before.saturating_sub(self.state.len())
    }
}
