use std::collections::HashMap;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(15 * 60);
const MAX_FAILURES: usize = 10;

/// Per-address sliding window over authentication failures. Used by the
/// external dashboard boundary; the core itself never consults it.
#[derive(Default)]
pub struct AuthRateLimiter {
    failures: HashMap<String, Vec<Instant>>,
}

impl AuthRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&mut self, addr: &str) {
        self.record_failure_at(addr, Instant::now());
    }

    pub fn is_blocked(&mut self, addr: &str) -> bool {
        self.is_blocked_at(addr, Instant::now())
    }

    pub fn clear(&mut self, addr: &str) {
        self.failures.remove(addr);
    }

    fn record_failure_at(&mut self, addr: &str, now: Instant) {
        let entries = self.failures.entry(addr.to_string()).or_default();
        entries.retain(|t| now.duration_since(*t) < WINDOW);
        entries.push(now);
    }

    fn is_blocked_at(&mut self, addr: &str, now: Instant) -> bool {
        match self.failures.get_mut(addr) {
            Some(entries) => {
                entries.retain(|t| now.duration_since(*t) < WINDOW);
                entries.len() >= MAX_FAILURES
            }
            None => false,
        }
    }
}
