mod store;

pub use store::{CounterSnapshot, CounterStore, InMemoryCounterStore};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{Component, ControlError, ControlResult, ErrorKind};

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyQuota {
    pub hourly_limit: u64,
    pub daily_limit: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub burst_limit: u64,
    #[serde(rename = "burst_window_ms", with = "crate::config::duration_ms")]
    pub burst_window: Duration,
    pub sustained_limit: u64,
    #[serde(rename = "sustained_window_ms", with = "crate::config::duration_ms")]
    pub sustained_window: Duration,
    pub api_key_hourly_limit: u64,
    pub api_key_daily_limit: u64,
    /// Per-key quotas replacing the hourly/daily defaults.
    pub api_key_overrides: BTreeMap<String, ApiKeyQuota>,
    /// Allow requests when the counter store fails.
    pub fail_open: bool,
    pub key_prefix: String,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            burst_limit: 20,
            burst_window: Duration::from_secs(1),
            sustained_limit: 300,
            sustained_window: Duration::from_secs(60),
            api_key_hourly_limit: 1000,
            api_key_daily_limit: 10_000,
            api_key_overrides: BTreeMap::new(),
            fail_open: true,
            key_prefix: "modgate:rl".to_string(),
        }
    }
}

impl RateLimiterConfig {
    pub fn validate(&self) -> ControlResult<()> {
        let limits = [
            ("burst_limit", self.burst_limit),
            ("sustained_limit", self.sustained_limit),
            ("api_key_hourly_limit", self.api_key_hourly_limit),
            ("api_key_daily_limit", self.api_key_daily_limit),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(ControlError::invalid_input(
                    Component::Limiter,
                    format!("{name} must be greater than zero"),
                ));
            }
        }
        if self.burst_window.is_zero() || self.sustained_window.is_zero() {
            return Err(ControlError::invalid_input(
                Component::Limiter,
                "rate limit windows must be greater than zero",
            ));
        }
        if let Some((key, _)) = self
            .api_key_overrides
            .iter()
            .find(|(_, quota)| quota.hourly_limit == 0 || quota.daily_limit == 0)
        {
            return Err(ControlError::invalid_input(
                Component::Limiter,
                format!("quota override for api key '{key}' must have non-zero limits"),
            ));
        }
        Ok(())
    }

    fn quota_for(&self, api_key: &str) -> ApiKeyQuota {
        self.api_key_overrides
            .get(api_key)
            .copied()
            .unwrap_or(ApiKeyQuota {
                hourly_limit: self.api_key_hourly_limit,
                daily_limit: self.api_key_daily_limit,
            })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitReason {
    IpBurstExceeded,
    IpSustainedExceeded,
    ApiKeyHourlyExceeded,
    ApiKeyDailyExceeded,
    BackendUnavailable,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct WindowUsage {
    pub count: u64,
    pub limit: u64,
    pub remaining: u64,
    pub resets_in_ms: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RateLimitUsage {
    pub ip_burst: Option<WindowUsage>,
    pub ip_sustained: Option<WindowUsage>,
    pub api_key_hourly: Option<WindowUsage>,
    pub api_key_daily: Option<WindowUsage>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub reason: Option<RateLimitReason>,
    #[serde(rename = "retry_after_ms", serialize_with = "serialize_retry_after")]
    pub retry_after: Option<Duration>,
    pub usage: RateLimitUsage,
    /// True when the counter store failed and the fail-open policy admitted the request.
    pub backend_degraded: bool,
}

impl RateLimitDecision {
    pub fn into_result(self) -> ControlResult<RateLimitUsage> {
        if self.allowed {
            return Ok(self.usage);
        }
        let reason = self.reason.unwrap_or(RateLimitReason::BackendUnavailable);
        let mut error = ControlError::new(
            Component::Limiter,
            ErrorKind::RateLimited,
            format!("request rejected: {}", reason.as_str()),
        );
        error.retry_after = self.retry_after;
        Err(error)
    }
}

impl RateLimitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IpBurstExceeded => "ip_burst_exceeded",
            Self::IpSustainedExceeded => "ip_sustained_exceeded",
            Self::ApiKeyHourlyExceeded => "api_key_hourly_exceeded",
            Self::ApiKeyDailyExceeded => "api_key_daily_exceeded",
            Self::BackendUnavailable => "backend_unavailable",
        }
    }
}

#[derive(Clone, Copy)]
enum Slot {
    IpBurst,
    IpSustained,
    ApiKeyHourly,
    ApiKeyDaily,
}

impl Slot {
    fn reason(self) -> RateLimitReason {
        match self {
            Self::IpBurst => RateLimitReason::IpBurstExceeded,
            Self::IpSustained => RateLimitReason::IpSustainedExceeded,
            Self::ApiKeyHourly => RateLimitReason::ApiKeyHourlyExceeded,
            Self::ApiKeyDaily => RateLimitReason::ApiKeyDailyExceeded,
        }
    }

    fn usage_mut(self, usage: &mut RateLimitUsage) -> &mut Option<WindowUsage> {
        match self {
            Self::IpBurst => &mut usage.ip_burst,
            Self::IpSustained => &mut usage.ip_sustained,
            Self::ApiKeyHourly => &mut usage.api_key_hourly,
            Self::ApiKeyDaily => &mut usage.api_key_daily,
        }
    }
}

struct Window {
    slot: Slot,
    key: String,
    limit: u64,
    length: Duration,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct LimiterStats {
    pub requests_allowed: u64,
    pub requests_rejected: u64,
    pub backend_errors: u64,
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    store: Arc<dyn CounterStore>,
    allowed: AtomicU64,
    rejected: AtomicU64,
    backend_errors: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig, store: Arc<dyn CounterStore>) -> ControlResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            allowed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            backend_errors: AtomicU64::new(0),
        })
    }

    /// Limiter backed by process-local counters.
    pub fn in_memory(config: RateLimiterConfig) -> ControlResult<Self> {
        Self::new(config, Arc::new(InMemoryCounterStore::new()))
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Counts the request against every applicable window and decides admission.
    ///
    /// Windows after the first exhausted one are not counted.
    pub fn check_request(&self, ip: &str, api_key: Option<&str>) -> RateLimitDecision {
        let decision = self.decide(ip, api_key);
        let counter = if decision.allowed {
            &self.allowed
        } else {
            &self.rejected
        };
        counter.fetch_add(1, Ordering::Relaxed);
        decision
    }

    pub fn get_stats(&self) -> LimiterStats {
        LimiterStats {
            requests_allowed: self.allowed.load(Ordering::Relaxed),
            requests_rejected: self.rejected.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
        }
    }

    fn decide(&self, ip: &str, api_key: Option<&str>) -> RateLimitDecision {
        let mut usage = RateLimitUsage::default();
        for window in self.windows(ip, api_key) {
            let snapshot = match self.store.increment(&window.key, window.length) {
                Ok(snapshot) => snapshot,
                Err(error) => return self.backend_failure(error, usage),
            };
            *window.slot.usage_mut(&mut usage) = Some(window_usage(snapshot, window.limit));

            if snapshot.count > window.limit {
                let retry_after = snapshot.ttl_remaining.min(window.length);
                tracing::debug!(
                    ip,
                    api_key = api_key.unwrap_or_default(),
                    reason = window.slot.reason().as_str(),
                    retry_after_ms = retry_after.as_millis() as u64,
                    "request rate limited"
                );
                return RateLimitDecision {
                    allowed: false,
                    reason: Some(window.slot.reason()),
                    retry_after: Some(retry_after),
                    usage,
                    backend_degraded: false,
                };
            }
        }
        tracing::trace!(ip, "request admitted by rate limiter");
        RateLimitDecision {
            allowed: true,
            reason: None,
            retry_after: None,
            usage,
            backend_degraded: false,
        }
    }

    /// Current counters without counting a request.
    pub fn usage(&self, ip: &str, api_key: Option<&str>) -> ControlResult<RateLimitUsage> {
        let mut usage = RateLimitUsage::default();
        for window in self.windows(ip, api_key) {
            let snapshot = self.store.peek(&window.key)?.unwrap_or(CounterSnapshot {
                count: 0,
                ttl_remaining: Duration::ZERO,
            });
            *window.slot.usage_mut(&mut usage) = Some(window_usage(snapshot, window.limit));
        }
        Ok(usage)
    }

    fn windows(&self, ip: &str, api_key: Option<&str>) -> Vec<Window> {
        let prefix = &self.config.key_prefix;
        let mut windows = vec![
            Window {
                slot: Slot::IpBurst,
                key: format!("{prefix}:ip:{ip}:burst"),
                limit: self.config.burst_limit,
                length: self.config.burst_window,
            },
            Window {
                slot: Slot::IpSustained,
                key: format!("{prefix}:ip:{ip}:sustained"),
                limit: self.config.sustained_limit,
                length: self.config.sustained_window,
            },
        ];
        if let Some(api_key) = api_key {
            let quota = self.config.quota_for(api_key);
            windows.push(Window {
                slot: Slot::ApiKeyHourly,
                key: format!("{prefix}:key:{api_key}:hourly"),
                limit: quota.hourly_limit,
                length: HOUR,
            });
            windows.push(Window {
                slot: Slot::ApiKeyDaily,
                key: format!("{prefix}:key:{api_key}:daily"),
                limit: quota.daily_limit,
                length: DAY,
            });
        }
        windows
    }

    fn backend_failure(&self, error: ControlError, usage: RateLimitUsage) -> RateLimitDecision {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
        if self.config.fail_open {
            tracing::warn!(error = %error, "rate limit store unavailable; admitting request");
            return RateLimitDecision {
                allowed: true,
                reason: None,
                retry_after: None,
                usage,
                backend_degraded: true,
            };
        }
        tracing::warn!(error = %error, "rate limit store unavailable; rejecting request");
        RateLimitDecision {
            allowed: false,
            reason: Some(RateLimitReason::BackendUnavailable),
            retry_after: Some(self.config.burst_window),
            usage,
            backend_degraded: true,
        }
    }
}

fn window_usage(snapshot: CounterSnapshot, limit: u64) -> WindowUsage {
    WindowUsage {
        count: snapshot.count,
        limit,
        remaining: limit.saturating_sub(snapshot.count),
        resets_in_ms: snapshot.ttl_remaining.as_millis() as u64,
    }
}

fn serialize_retry_after<S: serde::Serializer>(
    value: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}
