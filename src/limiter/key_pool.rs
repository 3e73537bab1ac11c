//! API key pool with per-key health tracking.
//!
//! Selection is round-robin over healthy keys, weighted by each key's
//! recent success rate. A retryable failure puts a key into cooldown
//! with exponentially growing duration; success halves it. Repeated
//! hard failures (authentication class) disable a key until an operator
//! re-enables it.

use crate::config::KeySettings;
use crate::constants::{KEY_DISABLE_THRESHOLD, KEY_SUCCESS_WINDOW};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyState {
    Healthy,
    Cooling,
    Disabled,
}

/// Selected-key handle passed through the invocation context. Carries
/// the secret for the agent boundary but never prints it.
#[derive(Clone)]
pub struct KeyHandle {
    pub id: String,
    pub provider: String,
    pub secret: String,
}

impl fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyHandle")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("secret", &"[redacted]")
            .finish()
    }
}

/// Health view of one key, safe to expose (no secret material).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyHealth {
    pub id: String,
    pub provider: String,
    pub state: KeyState,
    pub recent_success_rate: f64,
    pub in_flight: u32,
    pub cooldown_remaining_secs: u64,
}

struct KeyEntry {
    id: String,
    provider: String,
    secret: String,
    state: KeyState,
    cooldown_until: Option<Instant>,
    cooldown: Duration,
    consecutive_hard_failures: u32,
    window: VecDeque<bool>,
    in_flight: u32,
}

impl KeyEntry {
    fn new(settings: &KeySettings, cooldown_base: Duration) -> Self {
        Self {
            id: settings.id.clone(),
            provider: settings.provider.clone(),
            secret: settings.secret.clone(),
            state: KeyState::Healthy,
            cooldown_until: None,
            cooldown: cooldown_base,
            consecutive_hard_failures: 0,
            window: VecDeque::new(),
            in_flight: 0,
        }
    }

    fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let ok = self.window.iter().filter(|b| **b).count();
        ok as f64 / self.window.len() as f64
    }

    fn record(&mut self, ok: bool) {
        self.window.push_back(ok);
        while self.window.len() > KEY_SUCCESS_WINDOW {
            self.window.pop_front();
        }
    }

    /// Promote Cooling back to Healthy once the cooldown has elapsed.
    fn refresh(&mut self, now: Instant) -> bool {
        if self.state == KeyState::Cooling {
            if let Some(until) = self.cooldown_until {
                if now >= until {
                    self.state = KeyState::Healthy;
                    self.cooldown_until = None;
                    return true;
                }
            }
        }
        false
    }
}

struct PoolInner {
    keys: Vec<KeyEntry>,
    cursor: usize,
}

#[derive(Clone)]
pub struct KeyPool {
    inner: Arc<Mutex<PoolInner>>,
    cooldown_base: Duration,
    cooldown_max: Duration,
}

impl KeyPool {
    pub fn new(settings: &[KeySettings], cooldown_base: Duration, cooldown_max: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                keys: settings
                    .iter()
                    .map(|s| KeyEntry::new(s, cooldown_base))
                    .collect(),
                cursor: 0,
            })),
            cooldown_base,
            cooldown_max,
        }
    }

    /// Pick a key for the next call, or `None` when every key is
    /// cooling or disabled. Among healthy keys the best recent success
    /// rate wins, with ties resolved round-robin. Reports a recovered
    /// key via the return flag so callers can publish availability.
    pub fn select(&self) -> (Option<KeyHandle>, bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("key pool lock poisoned");
        let mut recovered = false;

        for key in inner.keys.iter_mut() {
            if key.refresh(now) {
                info!("API key {} recovered from cooldown", key.id);
                recovered = true;
            }
        }

        let len = inner.keys.len();
        if len == 0 {
            return (None, recovered);
        }

        let cursor = inner.cursor;
        let mut best: Option<usize> = None;
        let mut best_rank = (f64::MIN, u32::MAX);
        for offset in 0..len {
            let idx = (cursor + offset) % len;
            let key = &inner.keys[idx];
            if key.state != KeyState::Healthy {
                continue;
            }
            // Strictly-better comparison keeps the earliest rotated
            // candidate on ties, which is what makes this round-robin.
            let rank = (key.success_rate(), key.in_flight);
            if best.is_none() || rank.0 > best_rank.0 || (rank.0 == best_rank.0 && rank.1 < best_rank.1)
            {
                best = Some(idx);
                best_rank = rank;
            }
        }

        match best {
            Some(idx) => {
                inner.cursor = (idx + 1) % len;
                let key = &mut inner.keys[idx];
                key.in_flight += 1;
                (
                    Some(KeyHandle {
                        id: key.id.clone(),
                        provider: key.provider.clone(),
                        secret: key.secret.clone(),
                    }),
                    recovered,
                )
            }
            None => (None, recovered),
        }
    }

    /// Earliest instant at which a cooling key becomes available again.
    pub fn next_recovery(&self) -> Option<Instant> {
        let inner = self.inner.lock().expect("key pool lock poisoned");
        inner
            .keys
            .iter()
            .filter(|k| k.state == KeyState::Cooling)
            .filter_map(|k| k.cooldown_until)
            .min()
    }

    pub fn report_success(&self, id: &str) {
        let mut inner = self.inner.lock().expect("key pool lock poisoned");
        if let Some(key) = inner.keys.iter_mut().find(|k| k.id == id) {
            key.in_flight = key.in_flight.saturating_sub(1);
            key.record(true);
            key.consecutive_hard_failures = 0;
            key.cooldown = (key.cooldown / 2).max(self.cooldown_base);
        }
    }

    /// A 429/5xx/network failure: the key cools down with exponential
    /// backoff.
    pub fn report_retryable_failure(&self, id: &str) {
        let mut inner = self.inner.lock().expect("key pool lock poisoned");
        if let Some(key) = inner.keys.iter_mut().find(|k| k.id == id) {
            key.in_flight = key.in_flight.saturating_sub(1);
            key.record(false);
            key.state = KeyState::Cooling;
            key.cooldown_until = Some(Instant::now() + key.cooldown);
            warn!("API key {} cooling for {:?}", key.id, key.cooldown);
            key.cooldown = (key.cooldown * 2).min(self.cooldown_max);
        }
    }

    /// A 401/403-class failure: enough of these disables the key.
    pub fn report_hard_failure(&self, id: &str) {
        let mut inner = self.inner.lock().expect("key pool lock poisoned");
        if let Some(key) = inner.keys.iter_mut().find(|k| k.id == id) {
            key.in_flight = key.in_flight.saturating_sub(1);
            key.record(false);
            key.consecutive_hard_failures += 1;
            if key.consecutive_hard_failures >= KEY_DISABLE_THRESHOLD
                && key.state != KeyState::Disabled
            {
                warn!(
                    "API key {} disabled after {} consecutive hard failures",
                    key.id, key.consecutive_hard_failures
                );
                key.state = KeyState::Disabled;
            }
        }
    }

    /// Release a selection that produced no outcome (cancelled call).
    pub fn release(&self, id: &str) {
        let mut inner = self.inner.lock().expect("key pool lock poisoned");
        if let Some(key) = inner.keys.iter_mut().find(|k| k.id == id) {
            key.in_flight = key.in_flight.saturating_sub(1);
        }
    }

    /// Operator action: put a disabled key back in rotation.
    pub fn re_enable(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().expect("key pool lock poisoned");
        match inner.keys.iter_mut().find(|k| k.id == id) {
            Some(key) if key.state == KeyState::Disabled => {
                info!("API key {} re-enabled", key.id);
                key.state = KeyState::Healthy;
                key.consecutive_hard_failures = 0;
                key.cooldown = self.cooldown_base;
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> Vec<KeyHealth> {
        let now = Instant::now();
        let inner = self.inner.lock().expect("key pool lock poisoned");
        inner
            .keys
            .iter()
            .map(|key| KeyHealth {
                id: key.id.clone(),
                provider: key.provider.clone(),
                state: key.state,
                recent_success_rate: key.success_rate(),
                in_flight: key.in_flight,
                cooldown_remaining_secs: key
                    .cooldown_until
                    .filter(|until| *until > now)
                    .map(|until| until.duration_since(now).as_secs())
                    .unwrap_or(0),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_cooldown(ids: &[&str], base: Duration) -> KeyPool {
        let settings: Vec<KeySettings> = ids
            .iter()
            .map(|id| KeySettings {
                id: id.to_string(),
                provider: "anthropic".to_string(),
                secret: format!("sk-{id}"),
            })
            .collect();
        KeyPool::new(&settings, base, base * 64)
    }

    fn pool(ids: &[&str]) -> KeyPool {
        pool_with_cooldown(ids, Duration::from_secs(10))
    }

    #[test]
    fn rotates_across_equally_healthy_keys() {
        let pool = pool(&["a", "b"]);
        let (first, _) = pool.select();
        let first = first.unwrap();
        pool.report_success(&first.id);
        let (second, _) = pool.select();
        let second = second.unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn cooling_key_is_skipped_until_cooldown_expires() {
        let pool = pool(&["a", "b"]);
        pool.report_retryable_failure("a");

        for _ in 0..4 {
            let (key, _) = pool.select();
            let key = key.unwrap();
            assert_eq!(key.id, "b");
            pool.report_success("b");
        }
    }

    #[test]
    fn all_keys_cooling_yields_none() {
        let pool = pool(&["a"]);
        pool.report_retryable_failure("a");
        let (key, _) = pool.select();
        assert!(key.is_none());
        assert!(pool.next_recovery().is_some());
    }

    #[test]
    fn cooldown_doubles_across_failures() {
        let pool = pool_with_cooldown(&["a"], Duration::from_secs(10));
        pool.report_retryable_failure("a");
        pool.report_retryable_failure("a");

        let health = &pool.snapshot()[0];
        assert_eq!(health.state, KeyState::Cooling);
        // The second failure applied the doubled (20s) cooldown.
        assert!(health.cooldown_remaining_secs >= 15);
    }

    #[test]
    fn cooled_key_returns_after_expiry() {
        let pool = pool_with_cooldown(&["a"], Duration::from_millis(10));
        pool.report_retryable_failure("a");
        assert!(pool.select().0.is_none());

        std::thread::sleep(Duration::from_millis(30));
        let (key, recovered) = pool.select();
        assert!(key.is_some());
        assert!(recovered);
    }

    #[test]
    fn hard_failures_disable_and_re_enable_restores() {
        let pool = pool(&["a", "b"]);
        for _ in 0..KEY_DISABLE_THRESHOLD {
            pool.report_hard_failure("a");
        }
        assert_eq!(pool.snapshot()[0].state, KeyState::Disabled);

        // Disabled keys never come back on their own.
        let (key, _) = pool.select();
        assert_eq!(key.unwrap().id, "b");

        assert!(pool.re_enable("a"));
        assert_eq!(pool.snapshot()[0].state, KeyState::Healthy);
    }

    #[test]
    fn weighting_prefers_higher_success_rate() {
        let pool = pool(&["good", "bad"]);
        // One hard failure stays below the disable threshold, so "bad"
        // remains healthy with a 0.5 recent rate.
        pool.report_success("good");
        pool.report_success("good");
        pool.report_hard_failure("bad");
        pool.report_success("bad");

        for _ in 0..3 {
            let (key, _) = pool.select();
            let key = key.unwrap();
            assert_eq!(key.id, "good");
            pool.report_success("good");
        }
    }

    #[test]
    fn handle_debug_never_leaks_secret() {
        let pool = pool(&["a"]);
        let (key, _) = pool.select();
        let debugged = format!("{:?}", key.unwrap());
        assert!(debugged.contains("[redacted]"));
        assert!(!debugged.contains("sk-a"));
    }
}
