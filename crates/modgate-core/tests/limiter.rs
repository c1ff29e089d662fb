use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use modgate_core::limiter::{
    ApiKeyQuota, CounterSnapshot, CounterStore, InMemoryCounterStore, RateLimitReason, RateLimiter,
    RateLimiterConfig,
};
use modgate_core::models::{Component, ControlError, ControlResult, ErrorKind};

struct UnreachableStore;

impl CounterStore for UnreachableStore {
    fn increment(&self, _key: &str, _window: Duration) -> ControlResult<CounterSnapshot> {
        Err(ControlError::new(
            Component::Limiter,
            ErrorKind::StorageFailure,
            "connection refused",
        ))
    }

    fn peek(&self, _key: &str) -> ControlResult<Option<CounterSnapshot>> {
        Err(ControlError::new(
            Component::Limiter,
            ErrorKind::StorageFailure,
            "connection refused",
        ))
    }
}

fn burst_config(burst_limit: u64, burst_window: Duration) -> RateLimiterConfig {
    RateLimiterConfig {
        burst_limit,
        burst_window,
        ..RateLimiterConfig::default()
    }
}

#[test]
fn exactly_burst_limit_requests_pass_then_window_resets() {
    let window = Duration::from_millis(100);
    let limiter = RateLimiter::in_memory(burst_config(5, window)).unwrap();

    for _ in 0..5 {
        assert!(limiter.check_request("10.0.0.1", None).allowed);
    }
    let rejected = limiter.check_request("10.0.0.1", None);
    assert!(!rejected.allowed);
    assert_eq!(rejected.reason, Some(RateLimitReason::IpBurstExceeded));
    assert!(rejected.retry_after.is_some_and(|after| after <= window));

    std::thread::sleep(Duration::from_millis(120));
    assert!(limiter.check_request("10.0.0.1", None).allowed);
}

#[test]
fn sustained_window_is_enforced_independently() {
    let limiter = RateLimiter::in_memory(RateLimiterConfig {
        burst_limit: 100,
        sustained_limit: 3,
        ..RateLimiterConfig::default()
    })
    .unwrap();

    for _ in 0..3 {
        assert!(limiter.check_request("10.0.0.2", None).allowed);
    }
    let rejected = limiter.check_request("10.0.0.2", None);
    assert_eq!(rejected.reason, Some(RateLimitReason::IpSustainedExceeded));
    assert!(
        rejected
            .retry_after
            .is_some_and(|after| after <= Duration::from_secs(60))
    );
}

#[test]
fn addresses_do_not_share_counters() {
    let limiter = RateLimiter::in_memory(burst_config(1, Duration::from_secs(1))).unwrap();
    assert!(limiter.check_request("10.0.0.1", None).allowed);
    assert!(!limiter.check_request("10.0.0.1", None).allowed);
    assert!(limiter.check_request("10.0.0.2", None).allowed);
}

#[test]
fn api_key_quota_uses_overrides_and_maps_to_rate_limited_error() {
    let mut overrides = BTreeMap::new();
    overrides.insert(
        "partner".to_string(),
        ApiKeyQuota {
            hourly_limit: 2,
            daily_limit: 100,
        },
    );
    let limiter = RateLimiter::in_memory(RateLimiterConfig {
        api_key_overrides: overrides,
        ..RateLimiterConfig::default()
    })
    .unwrap();

    assert!(limiter.check_request("10.0.0.3", Some("partner")).allowed);
    assert!(limiter.check_request("10.0.0.4", Some("partner")).allowed);
    let rejected = limiter.check_request("10.0.0.5", Some("partner"));
    assert_eq!(rejected.reason, Some(RateLimitReason::ApiKeyHourlyExceeded));

    let error = rejected.into_result().expect_err("rejection maps to an error");
    assert_eq!(error.kind, ErrorKind::RateLimited);
    assert!(error.retry_after.is_some_and(|after| after <= Duration::from_secs(3600)));

    // other keys keep the default quota
    assert!(limiter.check_request("10.0.0.6", Some("internal")).allowed);
}

#[test]
fn usage_reports_counters_without_counting() {
    let limiter = RateLimiter::in_memory(burst_config(5, Duration::from_secs(1))).unwrap();
    limiter.check_request("10.0.0.7", Some("key"));
    limiter.check_request("10.0.0.7", Some("key"));

    let usage = limiter.usage("10.0.0.7", Some("key")).unwrap();
    let burst = usage.ip_burst.expect("burst window reported");
    assert_eq!(burst.count, 2);
    assert_eq!(burst.remaining, 3);
    assert_eq!(usage.api_key_daily.map(|daily| daily.count), Some(2));

    let again = limiter.usage("10.0.0.7", Some("key")).unwrap();
    assert_eq!(again.ip_burst.map(|burst| burst.count), Some(2));
}

#[test]
fn store_outage_fails_open_by_default() {
    let limiter = RateLimiter::new(RateLimiterConfig::default(), Arc::new(UnreachableStore)).unwrap();

    let decision = limiter.check_request("10.0.0.8", Some("key"));
    assert!(decision.allowed);
    assert!(decision.backend_degraded);
    assert_eq!(limiter.get_stats().backend_errors, 1);
    assert!(limiter.usage("10.0.0.8", None).is_err());
}

#[test]
fn store_outage_rejects_when_fail_closed() {
    let limiter = RateLimiter::new(
        RateLimiterConfig {
            fail_open: false,
            ..RateLimiterConfig::default()
        },
        Arc::new(UnreachableStore),
    )
    .unwrap();

    let decision = limiter.check_request("10.0.0.9", None);
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Some(RateLimitReason::BackendUnavailable));
    assert_eq!(limiter.get_stats().requests_rejected, 1);
}

#[test]
fn zero_limits_are_invalid() {
    assert!(RateLimiter::in_memory(burst_config(0, Duration::from_secs(1))).is_err());
}

#[test]
fn expired_ip_counters_do_not_accumulate() {
    let store = Arc::new(InMemoryCounterStore::new());
    let limiter = RateLimiter::new(
        RateLimiterConfig {
            burst_window: Duration::from_millis(5),
            sustained_window: Duration::from_millis(5),
            ..RateLimiterConfig::default()
        },
        store.clone(),
    )
    .unwrap();

    for round in 0..3 {
        for host in 0..1000 {
            let ip = format!("10.{round}.{}.{}", host / 256, host % 256);
            assert!(limiter.check_request(&ip, None).allowed);
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    // two windows per IP; only the last round can still be resident
    let held = store.len();
    assert!(held <= 4000, "store held {held} counters after 3000 distinct IPs");
    assert_eq!(store.purge_expired(), held);
}
