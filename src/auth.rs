//! Registration authentication and brute-force rate limiting.
//!
//! Each remote IP gets a failed-attempt record, created lazily on the first
//! rejection. Five failures engage a 15-minute block; every further failure
//! re-applies the same window. A successful registration clears the record,
//! and an hourly sweep drops records idle for more than a day.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::AuthError;

/// Per-address failed-attempt record.
#[derive(Debug, Clone)]
struct FailedAttempts {
    count: u32,
    last_attempt: Instant,
    blocked_until: Option<Instant>,
}

/// Limiter tuning. Production values match the original deployment; tests
/// shrink the windows.
#[derive(Debug, Clone)]
pub struct AuthLimiterConfig {
    /// Failures at which the block engages.
    pub max_attempts: u32,
    /// How long a blocked address stays blocked.
    pub block_window: Duration,
    /// Idle records older than this are swept.
    pub retention: Duration,
    /// Sweep cadence.
    pub sweep_interval: Duration,
}

impl Default for AuthLimiterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            block_window: Duration::from_secs(15 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Failed-authentication limiter keyed by remote IP (host part only).
///
/// A single mutex guards the map; every critical section is a few map
/// operations, never I/O.
pub struct AuthLimiter {
    attempts: Mutex<HashMap<IpAddr, FailedAttempts>>,
    config: AuthLimiterConfig,
}

impl AuthLimiter {
    pub fn new(config: AuthLimiterConfig) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// True while the address is inside its block window. Read-only; the
    /// window is applied by [`AuthLimiter::record_failure`].
    pub fn is_blocked(&self, addr: IpAddr) -> bool {
        let attempts = self.attempts.lock().expect("auth limiter poisoned");
        match attempts.get(&addr).and_then(|a| a.blocked_until) {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    /// Count a failed attempt. At the threshold the block window is set;
    /// further failures keep re-applying the same window.
    pub fn record_failure(&self, addr: IpAddr) {
        let now = Instant::now();
        let mut attempts = self.attempts.lock().expect("auth limiter poisoned");
        let entry = attempts.entry(addr).or_insert(FailedAttempts {
            count: 0,
            last_attempt: now,
            blocked_until: None,
        });
        entry.count += 1;
        entry.last_attempt = now;

        if entry.count >= self.config.max_attempts {
            entry.blocked_until = Some(now + self.config.block_window);
            let count = entry.count;
            drop(attempts);
            warn!(
                remote = %addr,
                attempts = count,
                block_secs = self.config.block_window.as_secs(),
                "address blocked after repeated failed registrations"
            );
        }
    }

    /// Forget an address after a successful registration.
    pub fn clear(&self, addr: IpAddr) {
        self.attempts
            .lock()
            .expect("auth limiter poisoned")
            .remove(&addr);
    }

    /// Drop records idle longer than the retention window. Returns how many
    /// were removed.
    pub fn sweep(&self) -> usize {
        let cutoff = Instant::now() - self.config.retention;
        let mut attempts = self.attempts.lock().expect("auth limiter poisoned");
        let before = attempts.len();
        attempts.retain(|_, a| a.last_attempt > cutoff);
        before - attempts.len()
    }

    pub fn tracked_addresses(&self) -> usize {
        self.attempts.lock().expect("auth limiter poisoned").len()
    }

    /// Periodic sweep task, stopped by the shutdown token.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(limiter.config.sweep_interval);
            tick.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let removed = limiter.sweep();
                        if removed > 0 {
                            debug!(removed, "swept stale auth records");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }
}

/// Validate a registration claim against the configured credential set.
///
/// Lookup is case-sensitive on `code` and case-insensitive on the subdomain;
/// the token comparison is constant-time. The caller has already consulted
/// [`AuthLimiter::is_blocked`].
pub fn authenticate(
    config: &Config,
    code: &str,
    claimed_subdomain: &str,
    token: &str,
) -> Result<(), AuthError> {
    let expected_subdomain = format!("{}.{}", code, config.domain);
    if !claimed_subdomain.eq_ignore_ascii_case(&expected_subdomain) {
        return Err(AuthError::SubdomainMismatch);
    }

    let hospital = config.hospital(code).ok_or(AuthError::UnknownHospital)?;
    if hospital.token.is_empty() {
        return Err(AuthError::UnknownHospital);
    }

    if hospital.token.as_bytes().ct_eq(token.as_bytes()).into() {
        Ok(())
    } else {
        Err(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_limiter(block_window: Duration) -> AuthLimiter {
        AuthLimiter::new(AuthLimiterConfig {
            max_attempts: 5,
            block_window,
            retention: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
        })
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn block_engages_at_threshold() {
        let limiter = test_limiter(Duration::from_secs(60));
        let ip = addr("10.0.0.1");

        for _ in 0..4 {
            limiter.record_failure(ip);
            assert!(!limiter.is_blocked(ip));
        }
        limiter.record_failure(ip);
        assert!(limiter.is_blocked(ip));
    }

    #[test]
    fn block_expires_after_window() {
        let limiter = test_limiter(Duration::from_millis(30));
        let ip = addr("10.0.0.2");
        for _ in 0..5 {
            limiter.record_failure(ip);
        }
        assert!(limiter.is_blocked(ip));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!limiter.is_blocked(ip));
    }

    #[test]
    fn further_failures_reapply_the_window() {
        let limiter = test_limiter(Duration::from_millis(80));
        let ip = addr("10.0.0.3");
        for _ in 0..5 {
            limiter.record_failure(ip);
        }
        std::thread::sleep(Duration::from_millis(50));
        // Still within the first window; a sixth failure restarts it.
        limiter.record_failure(ip);
        std::thread::sleep(Duration::from_millis(50));
        assert!(limiter.is_blocked(ip));
    }

    #[test]
    fn success_clears_the_record() {
        let limiter = test_limiter(Duration::from_secs(60));
        let ip = addr("10.0.0.4");
        for _ in 0..5 {
            limiter.record_failure(ip);
        }
        assert!(limiter.is_blocked(ip));
        limiter.clear(ip);
        assert!(!limiter.is_blocked(ip));
        assert_eq!(limiter.tracked_addresses(), 0);
    }

    #[test]
    fn addresses_are_independent() {
        let limiter = test_limiter(Duration::from_secs(60));
        for _ in 0..5 {
            limiter.record_failure(addr("10.0.0.5"));
        }
        assert!(limiter.is_blocked(addr("10.0.0.5")));
        assert!(!limiter.is_blocked(addr("10.0.0.6")));
    }

    #[test]
    fn sweep_drops_idle_records() {
        let limiter = AuthLimiter::new(AuthLimiterConfig {
            max_attempts: 5,
            block_window: Duration::from_secs(60),
            retention: Duration::from_millis(1),
            sweep_interval: Duration::from_secs(60),
        });
        limiter.record_failure(addr("10.0.0.7"));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.tracked_addresses(), 0);
    }

    mod credentials {
        use super::*;
        use crate::config::Config;

        fn test_config() -> Config {
            serde_json::from_value(serde_json::json!({
                "listen_addr": ":443",
                "domain": "example.test",
                "hospitals": [
                    {"code": "a", "subdomain": "a.example.test", "token": "t1"}
                ]
            }))
            .unwrap()
        }

        #[test]
        fn valid_claim_passes() {
            let config = test_config();
            assert!(authenticate(&config, "a", "a.example.test", "t1").is_ok());
        }

        #[test]
        fn subdomain_compare_is_case_insensitive() {
            let config = test_config();
            assert!(authenticate(&config, "a", "A.EXAMPLE.TEST", "t1").is_ok());
        }

        #[test]
        fn unknown_code_rejected() {
            let config = test_config();
            assert_eq!(
                authenticate(&config, "b", "b.example.test", "t1"),
                Err(AuthError::UnknownHospital)
            );
        }

        #[test]
        fn code_lookup_is_case_sensitive() {
            let config = test_config();
            // "A.example.test" does not match "A" + "." + domain? It does
            // case-insensitively, so the failure must come from the lookup.
            assert_eq!(
                authenticate(&config, "A", "a.example.test", "t1"),
                Err(AuthError::UnknownHospital)
            );
        }

        #[test]
        fn wrong_subdomain_rejected_before_lookup() {
            let config = test_config();
            assert_eq!(
                authenticate(&config, "a", "b.example.test", "t1"),
                Err(AuthError::SubdomainMismatch)
            );
        }

        #[test]
        fn wrong_token_rejected() {
            let config = test_config();
            assert_eq!(
                authenticate(&config, "a", "a.example.test", "wrong"),
                Err(AuthError::InvalidToken)
            );
        }
    }
}
