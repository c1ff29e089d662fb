use std::sync::{Arc, Mutex};
use std::time::Duration;

use modgate_core::coordinator::{FnHandler, StageSpec};
use modgate_core::governor::{ResourceSample, ResourceSampler};
use modgate_core::limiter::InMemoryCounterStore;
use modgate_core::models::{ControlResult, ErrorKind, Priority, StageOutput, TaskKind};
use modgate_core::{Admission, ControlPlane, ControlPlaneConfig, SubmitRequest};

#[derive(Clone)]
struct FixedSampler(Arc<Mutex<ResourceSample>>);

impl ResourceSampler for FixedSampler {
    fn sample(&mut self) -> ControlResult<ResourceSample> {
        Ok(*self.0.lock().unwrap())
    }
}

fn plane(config: ControlPlaneConfig) -> (ControlPlane, Arc<Mutex<ResourceSample>>) {
    let reading = Arc::new(Mutex::new(ResourceSample::new(20.0, 30.0)));
    let stages = vec![
        StageSpec::new(
            "ocr",
            FnHandler::arc(|_, task| {
                Ok(StageOutput::new().score("text_len", task.payload.len() as f64))
            }),
        ),
        StageSpec::new(
            "nsfw",
            FnHandler::arc(|_, _| Ok(StageOutput::new().score("score", 0.05))),
        ),
    ];
    let plane = ControlPlane::new(
        config,
        stages,
        Box::new(FixedSampler(reading.clone())),
        Arc::new(InMemoryCounterStore::new()),
    )
    .expect("config is valid");
    (plane, reading)
}

fn request(id: &str, ip: &str) -> SubmitRequest {
    SubmitRequest::new(id, b"hello".to_vec(), TaskKind::Text, ip)
}

#[tokio::test]
async fn admitted_task_is_scheduled_and_joined() {
    let (plane, _) = plane(ControlPlaneConfig::default());
    plane.start().unwrap();

    let admission = plane.submit(request("t1", "10.0.0.1")).await.unwrap();
    assert!(matches!(admission, Admission::Scheduled { degrade: false, .. }));

    let result = plane
        .wait(admission.task_id(), Duration::from_secs(2))
        .await
        .completed()
        .expect("task completes");
    assert_eq!(result.max_score("text_len"), Some(5.0));
    assert!(!result.is_degraded());

    let duplicate = plane.submit(request("t2", "10.0.0.1")).await.unwrap();
    let again = plane.submit(request("t2", "10.0.0.1")).await.unwrap();
    assert!(matches!(duplicate, Admission::Scheduled { .. }));
    assert!(matches!(again, Admission::Duplicate { .. }));

    plane.shutdown().await;
}

#[tokio::test]
async fn rate_limit_rejects_before_scheduling() {
    let mut config = ControlPlaneConfig::default();
    config.limiter.burst_limit = 2;
    let (plane, _) = plane(config);

    plane.submit(request("t1", "10.0.0.2")).await.unwrap();
    plane.submit(request("t2", "10.0.0.2")).await.unwrap();
    let error = plane
        .submit(request("t3", "10.0.0.2"))
        .await
        .expect_err("third request exceeds the burst");

    assert_eq!(error.kind, ErrorKind::RateLimited);
    assert!(error.is_admission_rejection());
    assert!(error.retry_after.is_some_and(|after| after <= Duration::from_secs(1)));
    assert_eq!(plane.coordinator().get_stats().tasks_scheduled, 2);
    assert_eq!(plane.stats().limiter.requests_rejected, 1);
}

#[tokio::test]
async fn governor_pressure_rejects_low_priority_but_not_critical() {
    let (plane, reading) = plane(ControlPlaneConfig::default());
    *reading.lock().unwrap() = ResourceSample::new(97.0, 40.0);
    plane.governor().tick().unwrap();

    let error = plane
        .submit(request("bg", "10.0.0.3").priority(Priority::Background))
        .await
        .expect_err("load shedding rejects background work");
    assert_eq!(error.kind, ErrorKind::ResourceExhausted);

    let admission = plane
        .submit(request("urgent", "10.0.0.3").priority(Priority::Critical))
        .await
        .unwrap();
    assert!(matches!(admission, Admission::Scheduled { .. }));
    assert_eq!(plane.coordinator().get_stats().tasks_scheduled, 1);
}

#[tokio::test]
async fn stats_aggregate_every_component() {
    let (plane, _) = plane(ControlPlaneConfig::default());
    plane.start().unwrap();
    let admission = plane.submit(request("t1", "10.0.0.4")).await.unwrap();
    plane.wait(admission.task_id(), Duration::from_secs(2)).await;

    let stats = plane.stats();
    assert_eq!(stats.coordinator.tasks_resolved, 1);
    assert_eq!(stats.breakers.len(), 2);
    assert_eq!(stats.limiter.requests_allowed, 1);

    let json = serde_json::to_value(&stats).expect("stats serialize");
    for key in ["coordinator", "breakers", "governor", "limiter"] {
        assert!(json.get(key).is_some(), "missing {key}");
    }

    plane.shutdown().await;
    assert!(!plane.governor().is_running());
}

#[test]
fn breaker_overrides_apply_per_stage() {
    let config = ControlPlaneConfig::from_json_str(
        r#"{ "breaker_overrides": { "nsfw": { "failure_threshold": 1, "window_size": 1 } } }"#,
    )
    .unwrap();
    let (plane, _) = plane(config);

    let nsfw = plane.breakers().get_or_create("nsfw");
    assert_eq!(nsfw.config().failure_threshold, 1);
    assert_eq!(plane.breakers().get_or_create("ocr").config().failure_threshold, 5);
}
