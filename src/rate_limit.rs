use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const MAX_FAILURES: usize = 5;
const WINDOW: Duration = Duration::from_secs(15 * 60);
const LOCKOUT: Duration = Duration::from_secs(30 * 60);

/// Sliding-window login throttle, keyed by lowercased email. Process-local:
/// a restart clears it, which matches how the rest of the ephemeral state
/// (chat presence, card cache) behaves.
pub struct LoginRateLimiter {
    inner: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    failures: Vec<Instant>,
    locked_until: Option<Instant>,
}

impl LoginRateLimiter {
    pub fn new() -> Self {
        LoginRateLimiter {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Err(seconds remaining) when the account is locked out.
    pub fn check(&self, email: &str) -> Result<(), u64> {
        self.check_at(email, Instant::now())
    }

    /// Returns true when this failure tripped the lockout.
    pub fn record_failure(&self, email: &str) -> bool {
        self.record_failure_at(email, Instant::now())
    }

    pub fn record_success(&self, email: &str) {
        let mut map = self.inner.lock().unwrap();
        map.remove(&email.to_lowercase());
    }

    fn check_at(&self, email: &str, now: Instant) -> Result<(), u64> {
        let mut map = self.inner.lock().unwrap();
        let Some(entry) = map.get_mut(&email.to_lowercase()) else {
            return Ok(());
        };
        match entry.locked_until {
            Some(until) if until > now => Err((until - now).as_secs().max(1)),
            Some(_) => {
                // Lockout elapsed; start over.
                map.remove(&email.to_lowercase());
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn record_failure_at(&self, email: &str, now: Instant) -> bool {
        let mut map = self.inner.lock().unwrap();
        let entry = map.entry(email.to_lowercase()).or_insert(Entry {
            failures: Vec::new(),
            locked_until: None,
        });
        entry.failures.retain(|t| now.duration_since(*t) < WINDOW);
        entry.failures.push(now);
        if entry.failures.len() >= MAX_FAILURES {
            entry.locked_until = Some(now + LOCKOUT);
            entry.failures.clear();
            true
        } else {
            false
        }
    }
}

impl Default for LoginRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locks_on_the_fifth_failure() {
        let rl = LoginRateLimiter::new();
        let t0 = Instant::now();
        for i in 0..4 {
            assert!(!rl.record_failure_at("a@b.c", t0 + Duration::from_secs(i)));
            assert!(rl.check_at("a@b.c", t0 + Duration::from_secs(i)).is_ok());
        }
        assert!(rl.record_failure_at("a@b.c", t0 + Duration::from_secs(4)));
        assert!(rl.check_at("a@b.c", t0 + Duration::from_secs(5)).is_err());
    }

    #[test]
    fn failures_outside_the_window_do_not_count() {
        let rl = LoginRateLimiter::new();
        let t0 = Instant::now();
        for i in 0..4 {
            rl.record_failure_at("a@b.c", t0 + Duration::from_secs(i));
        }
        // Fifth failure 16 minutes later: the first four have aged out.
        let late = t0 + Duration::from_secs(16 * 60);
        assert!(!rl.record_failure_at("a@b.c", late));
        assert!(rl.check_at("a@b.c", late).is_ok());
    }

    #[test]
    fn lockout_expires_after_thirty_minutes() {
        let rl = LoginRateLimiter::new();
        let t0 = Instant::now();
        for _ in 0..5 {
            rl.record_failure_at("a@b.c", t0);
        }
        assert!(rl.check_at("a@b.c", t0 + Duration::from_secs(29 * 60)).is_err());
        assert!(rl.check_at("a@b.c", t0 + Duration::from_secs(30 * 60) + Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn success_clears_the_tracker() {
        let rl = LoginRateLimiter::new();
        let t0 = Instant::now();
        for _ in 0..5 {
            rl.record_failure_at("a@b.c", t0);
        }
        rl.record_success("a@b.c");
        assert!(rl.check_at("a@b.c", t0 + Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn keys_are_case_insensitive() {
        let rl = LoginRateLimiter::new();
        let t0 = Instant::now();
        for _ in 0..5 {
            rl.record_failure_at("A@B.C", t0);
        }
        assert!(rl.check_at("a@b.c", t0 + Duration::from_secs(1)).is_err());
    }
}
