// MCP Gateway - restart policy
// Crash accounting within a sliding window and full-jitter exponential backoff.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::GatewayConfig;

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Crashes tolerated within `window`; reaching it stops the service.
    pub max_crashes: usize,
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_crashes: 5,
            window: Duration::from_secs(60),
        }
    }
}

impl From<&GatewayConfig> for RestartPolicy {
    fn from(cfg: &GatewayConfig) -> Self {
        Self {
            base: cfg.restart_base,
            cap: cfg.restart_cap,
            max_crashes: cfg.restart_max_crashes,
            window: cfg.restart_window,
        }
    }
}

impl RestartPolicy {
    /// Upper bound of the backoff before the `attempt`-th respawn (1-based):
    /// `min(cap, base * 2^(attempt-1))`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.base.saturating_mul(1u32 << shift).min(self.cap)
    }

    /// Full jitter: uniform in `[0, ceiling(attempt)]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if ceiling.is_zero() {
            return ceiling;
        }
        let millis = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
        Duration::from_millis(millis)
    }
}

/// What to do after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Respawn { attempt: u32, delay: Duration },
    GiveUp { crashes: usize },
}

#[derive(Debug, Default)]
pub struct CrashHistory {
    crashes: VecDeque<Instant>,
}

impl CrashHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a crash at `now` and decides whether a respawn is allowed.
    pub fn record(&mut self, policy: &RestartPolicy, now: Instant) -> RestartDecision {
        self.crashes.push_back(now);
        self.prune(policy, now);
        let crashes = self.crashes.len();
        if crashes >= policy.max_crashes {
            RestartDecision::GiveUp { crashes }
        } else {
            let attempt = crashes as u32;
            RestartDecision::Respawn {
                attempt,
                delay: policy.backoff(attempt),
            }
        }
    }

    pub fn count(&mut self, policy: &RestartPolicy, now: Instant) -> usize {
        self.prune(policy, now);
        self.crashes.len()
    }

    /// Admin restart forgets past crashes.
    pub fn reset(&mut self) {
        self.crashes.clear();
    }

    fn prune(&mut self, policy: &RestartPolicy, now: Instant) {
        while let Some(first) = self.crashes.front() {
            if now.duration_since(*first) > policy.window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
    }
}
