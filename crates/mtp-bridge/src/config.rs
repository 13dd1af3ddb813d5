//! Bridge configuration.
//!
//! Priority: environment variables > defaults. Every knob has a default that
//! matches what phones in the wild tolerate; the `MTP_BRIDGE_*` variables exist
//! for development and for slow devices.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Which timeout/attempt/backoff policy a call runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    /// Discovery: scan, device info, storages.
    Quick,
    /// Listing, folder ops, uploads, storage info.
    Normal,
    /// Normal policy with the long download timeout.
    Download,
}

/// Delay before a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `attempt² × base`, capped at `cap`.
    Quadratic { base: Duration, cap: Duration },
}

impl Backoff {
    /// Delay before retry number `attempt` (1 for the first retry).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Quadratic { base, cap } => base.saturating_mul(attempt.saturating_mul(attempt)).min(cap),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Budget for one attempt, end to end.
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Issue the memory-reclaim hint before each retry.
    pub reclaim_before_retry: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub quick: RetryPolicy,
    pub normal: RetryPolicy,
    pub download_timeout: Duration,
}

impl RetryConfig {
    pub fn policy(&self, class: CallClass) -> RetryPolicy {
        match class {
            CallClass::Quick => self.quick.clone(),
            CallClass::Normal => self.normal.clone(),
            CallClass::Download => RetryPolicy {
                timeout: self.download_timeout,
                ..self.normal.clone()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_size: usize,
    /// Free entries idle longer than this are swept.
    pub entry_ttl: Duration,
    pub cleanup_tick: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Pause between a device reset and reopening it.
    pub recovery_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Longest folder or file name accepted, in characters.
    pub max_name_length: usize,
    /// Downloads above this size are logged as large.
    pub large_file_threshold: u64,
    /// Uploads above this size are rejected.
    pub max_file_size: u64,
}

/// All bridge configuration. Immutable once the connection manager is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub retry: RetryConfig,
    pub pool: PoolConfig,
    pub session: SessionConfig,
    pub limits: Limits,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig {
                quick: RetryPolicy {
                    timeout: Duration::from_secs(5),
                    max_attempts: 1,
                    backoff: Backoff::Fixed(Duration::from_millis(200)),
                    reclaim_before_retry: false,
                },
                normal: RetryPolicy {
                    timeout: Duration::from_secs(45),
                    max_attempts: 3,
                    backoff: Backoff::Quadratic {
                        base: Duration::from_millis(500),
                        cap: Duration::from_secs(2),
                    },
                    reclaim_before_retry: true,
                },
                download_timeout: Duration::from_secs(5 * 60),
            },
            pool: PoolConfig {
                max_size: 3,
                entry_ttl: Duration::from_secs(2 * 60),
                cleanup_tick: Duration::from_secs(60),
            },
            session: SessionConfig {
                recovery_delay: Duration::from_secs(1),
            },
            limits: Limits {
                max_name_length: 255,
                large_file_threshold: 100 * 1024 * 1024,
                max_file_size: 10 * 1024 * 1024 * 1024,
            },
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by `MTP_BRIDGE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns. Unparseable values are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let millis = |name: &str| parse::<u64>(&lookup, name).map(Duration::from_millis);
        let secs = |name: &str| parse::<u64>(&lookup, name).map(Duration::from_secs);

        if let Some(v) = millis("MTP_BRIDGE_QUICK_TIMEOUT_MS") {
            config.retry.quick.timeout = v;
        }
        if let Some(v) = millis("MTP_BRIDGE_NORMAL_TIMEOUT_MS") {
            config.retry.normal.timeout = v;
        }
        if let Some(v) = millis("MTP_BRIDGE_DOWNLOAD_TIMEOUT_MS") {
            config.retry.download_timeout = v;
        }
        if let Some(v) = parse::<u32>(&lookup, "MTP_BRIDGE_NORMAL_ATTEMPTS").filter(|v| *v > 0) {
            config.retry.normal.max_attempts = v;
        }
        if let Some(v) = parse::<usize>(&lookup, "MTP_BRIDGE_POOL_MAX_SIZE").filter(|v| *v > 0) {
            config.pool.max_size = v;
        }
        if let Some(v) = secs("MTP_BRIDGE_POOL_TTL_SECS") {
            config.pool.entry_ttl = v;
        }
        if let Some(v) = secs("MTP_BRIDGE_POOL_CLEANUP_SECS").filter(|v| !v.is_zero()) {
            config.pool.cleanup_tick = v;
        }
        if let Some(v) = millis("MTP_BRIDGE_RECOVERY_DELAY_MS") {
            config.session.recovery_delay = v;
        }
        config
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.retry.quick.timeout, Duration::from_secs(5));
        assert_eq!(config.retry.quick.max_attempts, 1);
        assert_eq!(config.retry.normal.timeout, Duration::from_secs(45));
        assert_eq!(config.retry.normal.max_attempts, 3);
        assert_eq!(config.pool.max_size, 3);
        assert_eq!(config.pool.entry_ttl, Duration::from_secs(120));
        assert_eq!(config.limits.max_name_length, 255);
    }

    #[test]
    fn test_normal_backoff_is_capped() {
        let backoff = BridgeConfig::default().retry.normal.backoff;
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(2), Duration::from_millis(2000));
        // Would be 4500 ms uncapped.
        assert_eq!(backoff.delay(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_quick_backoff_is_fixed() {
        let backoff = BridgeConfig::default().retry.quick.backoff;
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(5), Duration::from_millis(200));
    }

    #[test]
    fn test_download_class_uses_long_timeout() {
        let retry = BridgeConfig::default().retry;
        let policy = retry.policy(CallClass::Download);
        assert_eq!(policy.timeout, Duration::from_secs(300));
        assert_eq!(policy.max_attempts, retry.normal.max_attempts);
        assert_eq!(policy.backoff, retry.normal.backoff);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = BridgeConfig::from_lookup(|name| match name {
            "MTP_BRIDGE_POOL_MAX_SIZE" => Some("5".to_string()),
            "MTP_BRIDGE_NORMAL_TIMEOUT_MS" => Some(" 1500 ".to_string()),
            "MTP_BRIDGE_NORMAL_ATTEMPTS" => Some("lots".to_string()),
            _ => None,
        });
        assert_eq!(config.pool.max_size, 5);
        assert_eq!(config.retry.normal.timeout, Duration::from_millis(1500));
        assert_eq!(config.retry.normal.max_attempts, 3);
    }

    #[test]
    fn test_from_lookup_rejects_zero_pool_size() {
        let config = BridgeConfig::from_lookup(|name| (name == "MTP_BRIDGE_POOL_MAX_SIZE").then(|| "0".to_string()));
        assert_eq!(config.pool.max_size, 3);
    }

    #[test]
    fn test_from_env_returns_config() {
        let config = BridgeConfig::from_env();
        assert!(config.pool.max_size > 0);
    }
}
