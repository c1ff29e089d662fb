use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use modgate_core::breaker::{
    BreakerConfig, BreakerError, BreakerRegistry, BreakerState, CircuitBreaker,
};
use modgate_core::models::{Component, ControlError, ErrorKind};

fn fast_config() -> BreakerConfig {
    BreakerConfig {
        failure_threshold: 3,
        success_threshold: 2,
        timeout: Duration::from_millis(50),
        window_size: 10,
    }
}

fn fail(breaker: &CircuitBreaker, calls: &AtomicUsize) -> bool {
    breaker
        .call(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("dependency down")
        })
        .is_err_and(|error| error.is_open())
}

fn succeed(breaker: &CircuitBreaker, calls: &AtomicUsize) -> bool {
    breaker
        .call(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, &str>(())
        })
        .is_ok()
}

#[test]
fn opens_after_threshold_and_short_circuits_calls() {
    let breaker = CircuitBreaker::new("nsfw", fast_config());
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
        assert!(!fail(&breaker, &calls), "failures before opening reach the handler");
    }
    assert_eq!(breaker.state(), BreakerState::Open);

    for _ in 0..5 {
        assert!(fail(&breaker, &calls), "open circuit rejects");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let stats = breaker.get_stats();
    assert_eq!(stats.rejected_calls, 5);
    assert_eq!(stats.total_failures, 3);
    assert!(stats.time_until_retry_ms.is_some_and(|ms| ms <= 50));
}

#[test]
fn half_open_probe_successes_close_the_circuit() {
    let breaker = CircuitBreaker::new("ocr", fast_config());
    let calls = AtomicUsize::new(0);
    for _ in 0..3 {
        fail(&breaker, &calls);
    }

    std::thread::sleep(Duration::from_millis(70));
    assert!(succeed(&breaker, &calls));
    assert_eq!(breaker.state(), BreakerState::HalfOpen);
    assert!(succeed(&breaker, &calls));
    assert_eq!(breaker.state(), BreakerState::Closed);

    let path: Vec<_> = breaker
        .transitions()
        .iter()
        .map(|transition| transition.to)
        .collect();
    assert_eq!(
        path,
        vec![BreakerState::Open, BreakerState::HalfOpen, BreakerState::Closed]
    );
}

#[test]
fn single_failure_while_half_open_reopens() {
    let breaker = CircuitBreaker::new("violence", fast_config());
    let calls = AtomicUsize::new(0);
    for _ in 0..3 {
        fail(&breaker, &calls);
    }

    std::thread::sleep(Duration::from_millis(70));
    assert!(!fail(&breaker, &calls), "probe reaches the handler");
    assert_eq!(breaker.state(), BreakerState::Open);
    assert!(fail(&breaker, &calls), "cooldown restarts after a failed probe");
}

#[test]
fn rejection_error_carries_retry_hint() {
    let breaker = CircuitBreaker::new("weapons", fast_config());
    breaker.force_open();

    let error = breaker
        .try_acquire()
        .expect_err("forced open circuit rejects");
    assert_eq!(error.kind, ErrorKind::CircuitOpen);
    assert!(error.retry_after.is_some_and(|after| after <= Duration::from_millis(50)));

    breaker.force_close();
    assert!(breaker.try_acquire().is_ok());
}

#[test]
fn reset_clears_counters_but_keeps_history() {
    let breaker = CircuitBreaker::new("policy", fast_config());
    let calls = AtomicUsize::new(0);
    for _ in 0..3 {
        fail(&breaker, &calls);
    }

    breaker.reset();
    let stats = breaker.get_stats();
    assert_eq!(stats.state, BreakerState::Closed);
    assert_eq!(stats.total_calls, 0);
    assert_eq!(stats.failure_count, 0);
    assert_eq!(stats.transitions, 2);
}

#[tokio::test]
async fn async_calls_are_guarded_the_same_way() {
    let breaker = CircuitBreaker::new("remote", fast_config());
    for _ in 0..3 {
        let result = breaker
            .call_async(async { Err::<(), _>("timeout") })
            .await;
        assert!(result.is_err_and(|error| !error.is_open()));
    }

    let invoked = AtomicUsize::new(0);
    let result = breaker
        .call_async(async {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok::<_, &str>(())
        })
        .await;
    assert!(result.is_err_and(|error| error.is_open()));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[test]
fn registry_isolates_breakers_and_applies_overrides() {
    let registry = BreakerRegistry::new(fast_config()).with_override(
        "ocr",
        BreakerConfig {
            failure_threshold: 1,
            window_size: 1,
            ..fast_config()
        },
    );
    let ocr = registry.get_or_create("ocr");
    let nsfw = registry.get_or_create("nsfw");
    assert!(Arc::ptr_eq(&ocr, &registry.get_or_create("ocr")));

    let calls = AtomicUsize::new(0);
    fail(&ocr, &calls);
    assert_eq!(ocr.state(), BreakerState::Open);
    assert_eq!(nsfw.state(), BreakerState::Closed);

    let names: Vec<_> = registry.all_stats().into_iter().map(|stats| stats.name).collect();
    assert_eq!(names, vec!["nsfw".to_string(), "ocr".to_string()]);

    registry.reset_all();
    assert_eq!(ocr.state(), BreakerState::Closed);
}

#[test]
fn zero_sized_window_is_raised_to_the_failure_threshold() {
    let breaker = CircuitBreaker::new(
        "spam",
        BreakerConfig {
            window_size: 0,
            ..fast_config()
        },
    );
    assert_eq!(breaker.config().window_size, 3);

    let calls = AtomicUsize::new(0);
    for _ in 0..50 {
        succeed(&breaker, &calls);
    }
    assert_eq!(breaker.get_stats().failure_count, 0);
    for _ in 0..3 {
        fail(&breaker, &calls);
    }
    assert_eq!(breaker.state(), BreakerState::Open);

    let registry = BreakerRegistry::new(BreakerConfig {
        failure_threshold: 0,
        window_size: 0,
        ..fast_config()
    });
    let created = registry.get_or_create("ocr");
    assert_eq!(created.config().failure_threshold, 1);
    assert_eq!(created.config().window_size, 1);
}

#[test]
fn breaker_errors_convert_into_control_errors() {
    let breaker = CircuitBreaker::new("toxicity", fast_config());
    let inner = breaker
        .call(|| {
            Err::<(), _>(ControlError::new(
                Component::Coordinator,
                ErrorKind::HandlerFailure,
                "model timed out",
            ))
        })
        .expect_err("handler error is returned")
        .into_control_error();
    assert_eq!(inner.kind, ErrorKind::HandlerFailure);
    assert_eq!(inner.component, Some(Component::Coordinator));
    assert_eq!(inner.message, "model timed out");

    breaker.force_open();
    let open = breaker
        .call(|| Ok::<_, ControlError>(()))
        .expect_err("open circuit rejects");
    assert!(matches!(open, BreakerError::Open { .. }));
    let open = open.into_control_error();
    assert_eq!(open.kind, ErrorKind::CircuitOpen);
    assert!(open.retry_after.is_some());
}
