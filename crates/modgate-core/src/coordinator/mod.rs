pub(crate) mod accumulator;
pub mod handler;
mod metrics;

pub use handler::{FnHandler, StageSpec, TaskHandler};
pub use metrics::CoordinatorStats;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};

use crate::breaker::{BreakerRegistry, CircuitBreaker};
use crate::coordinator::accumulator::{RecordOutcome, ResultAccumulator};
use crate::coordinator::metrics::CoordinatorMetrics;
use crate::models::{
    Component, ControlError, ControlResult, ErrorKind, StageFailure, StageOutcome, StageResult,
    Task, TaskId, TaskKind, WaitOutcome,
};

type Batch = Arc<[Task]>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub batch_size: usize,
    #[serde(rename = "max_wait_ms", with = "crate::config::duration_ms")]
    pub max_wait: Duration,
    pub max_workers: usize,
    pub queue_capacity: usize,
    pub stage_queue_capacity: usize,
    #[serde(rename = "shutdown_grace_ms", with = "crate::config::duration_ms")]
    pub shutdown_grace: Duration,
    /// How long a resolved result waits for `wait_for_result` before it is dropped.
    #[serde(rename = "result_retention_ms", with = "crate::config::duration_ms")]
    pub result_retention: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            max_wait: Duration::from_millis(50),
            max_workers: 4,
            queue_capacity: 1024,
            stage_queue_capacity: 16,
            shutdown_grace: Duration::from_secs(5),
            result_retention: Duration::from_secs(300),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> ControlResult<()> {
        if self.batch_size == 0 || self.max_workers == 0 {
            return Err(ControlError::invalid_input(
                Component::Coordinator,
                "batch_size and max_workers must be greater than zero",
            ));
        }
        if self.queue_capacity == 0 || self.stage_queue_capacity == 0 {
            return Err(ControlError::invalid_input(
                Component::Coordinator,
                "queue capacities must be greater than zero",
            ));
        }
        if self.max_wait.is_zero() || self.result_retention.is_zero() {
            return Err(ControlError::invalid_input(
                Component::Coordinator,
                "max_wait and result_retention must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct ShutdownReport {
    pub drained: bool,
    pub force_resolved: usize,
}

/// Groups scheduled tasks into batches, fans each batch out to every stage
/// and joins the per-stage results back per task.
pub struct BatchCoordinator {
    config: CoordinatorConfig,
    stages: Vec<StageSpec>,
    breakers: Arc<BreakerRegistry>,
    accumulator: Arc<ResultAccumulator>,
    metrics: Arc<CoordinatorMetrics>,
    permits: Arc<Semaphore>,
    admissions: Mutex<Option<mpsc::Sender<Task>>>,
    admission_rx: Mutex<Option<mpsc::Receiver<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    accepting: AtomicBool,
    running: AtomicBool,
}

impl BatchCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        stages: Vec<StageSpec>,
        breakers: Arc<BreakerRegistry>,
    ) -> ControlResult<Self> {
        config.validate()?;
        if stages.is_empty() {
            return Err(ControlError::invalid_input(
                Component::Coordinator,
                "at least one stage is required",
            ));
        }
        let mut seen = HashSet::new();
        for stage in &stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(ControlError::invalid_input(
                    Component::Coordinator,
                    format!("duplicate stage registration '{}'", stage.name),
                ));
            }
        }

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let accumulator = ResultAccumulator::new(
            stages.iter().map(|stage| stage.name.clone()),
            config.result_retention,
        );

        Ok(Self {
            permits: Arc::new(Semaphore::new(config.max_workers)),
            config,
            stages,
            breakers,
            accumulator: Arc::new(accumulator),
            metrics: Arc::new(CoordinatorMetrics::default()),
            admissions: Mutex::new(Some(tx)),
            admission_rx: Mutex::new(Some(rx)),
            workers: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
            running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name.as_str()).collect()
    }

    /// Registers a task for batching. Returns `Ok(false)` when `task_id` is
    /// already pending or its result is still held for a waiter (at most
    /// `result_retention`), in which case nothing else happens.
    pub async fn schedule(
        &self,
        task_id: impl Into<TaskId>,
        payload: impl Into<Arc<[u8]>>,
        kind: TaskKind,
    ) -> ControlResult<bool> {
        self.schedule_task(Task::new(task_id, payload, kind)).await
    }

    pub async fn schedule_task(&self, task: Task) -> ControlResult<bool> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(shutdown_error("coordinator is shutting down"));
        }
        if !self.accumulator.register(&task) {
            self.metrics.duplicate();
            tracing::trace!(task_id = %task.id, "duplicate schedule ignored");
            return Ok(false);
        }

        let sender = lock(&self.admissions).clone();
        let Some(sender) = sender else {
            self.accumulator.discard(&task.id);
            return Err(shutdown_error("coordinator is shutting down"));
        };

        let task_id = task.id.clone();
        if sender.send(task).await.is_err() {
            self.accumulator.discard(&task_id);
            return Err(shutdown_error("admission queue is closed"));
        }

        self.metrics.scheduled();
        Ok(true)
    }

    /// Suspends the caller until the task resolves or `timeout` elapses.
    ///
    /// A timeout abandons the task: its accumulator entry is dropped and any
    /// stage result arriving later is discarded.
    pub async fn wait_for_result(&self, task_id: &TaskId, timeout: Duration) -> WaitOutcome {
        let outcome = self.accumulator.wait(task_id, timeout).await;
        if outcome.is_timed_out() {
            self.metrics.timed_out();
            tracing::debug!(task_id = %task_id, ?timeout, "task wait timed out");
        }
        outcome
    }

    /// Starts the batcher and one loop per stage.
    pub fn run_workers(&self) -> ControlResult<()> {
        let Some(admission_rx) = lock(&self.admission_rx).take() else {
            return Err(ControlError::invalid_input(
                Component::Coordinator,
                "workers are already running or the coordinator was shut down",
            ));
        };

        let mut handles = Vec::with_capacity(self.stages.len() + 1);
        let mut stage_senders = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            let (tx, rx) = mpsc::channel::<Batch>(self.config.stage_queue_capacity);
            stage_senders.push((stage.name.clone(), tx));

            let runner = StageRunner {
                stage: stage.clone(),
                breaker: self.breakers.get_or_create(&stage.name),
                accumulator: self.accumulator.clone(),
                metrics: self.metrics.clone(),
                permits: self.permits.clone(),
            };
            handles.push(tokio::spawn(runner.run(rx)));
        }

        handles.push(tokio::spawn(run_batcher(
            admission_rx,
            stage_senders,
            self.config.batch_size,
            self.config.max_wait,
            self.metrics.clone(),
        )));

        lock(&self.workers).extend(handles);
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            stages = self.stages.len(),
            batch_size = self.config.batch_size,
            max_workers = self.config.max_workers,
            "batch coordinator started"
        );
        Ok(())
    }

    /// Stops admissions, drains in-flight batches for up to `shutdown_grace`,
    /// then resolves whatever is still pending with a shutdown error.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.accepting.store(false, Ordering::SeqCst);
        lock(&self.admissions).take();
        lock(&self.admission_rx).take();

        let handles: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        let abort_handles: Vec<_> = handles.iter().map(|handle| handle.abort_handle()).collect();
        let drained = tokio::time::timeout(self.config.shutdown_grace, async move {
            for handle in handles {
                let _ = handle.await;
            }
        })
        .await
        .is_ok();

        if !drained {
            tracing::warn!(
                grace = ?self.config.shutdown_grace,
                "stage loops did not drain in time; aborting"
            );
            for handle in abort_handles {
                handle.abort();
            }
        }

        let force_resolved = self
            .accumulator
            .fail_all(&shutdown_error("coordinator shut down before the task completed"));
        self.running.store(false, Ordering::SeqCst);
        tracing::info!(drained, force_resolved, "batch coordinator stopped");

        ShutdownReport {
            drained,
            force_resolved,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.accumulator.pending_count()
    }

    pub fn stage_invocations(&self, stage: &str) -> u64 {
        self.metrics.invocations_for(stage)
    }

    pub fn get_stats(&self) -> CoordinatorStats {
        self.accumulator.evict_expired();
        self.metrics.snapshot(
            self.accumulator.pending_count(),
            self.accumulator.uncollected_count(),
            self.accumulator.evicted_count(),
        )
    }
}

async fn run_batcher(
    mut admissions: mpsc::Receiver<Task>,
    stages: Vec<(String, mpsc::Sender<Batch>)>,
    batch_size: usize,
    max_wait: Duration,
    metrics: Arc<CoordinatorMetrics>,
) {
    let mut pending: Vec<Task> = Vec::with_capacity(batch_size);

    loop {
        let next = if pending.is_empty() {
            admissions.recv().await
        } else {
            match tokio::time::timeout(max_wait, admissions.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    flush(&mut pending, &stages, &metrics).await;
                    continue;
                }
            }
        };

        match next {
            Some(task) => {
                pending.push(task);
                if pending.len() >= batch_size {
                    flush(&mut pending, &stages, &metrics).await;
                }
            }
            None => {
                flush(&mut pending, &stages, &metrics).await;
                tracing::debug!("admission queue closed; batcher exiting");
                return;
            }
        }
    }
}

async fn flush(
    pending: &mut Vec<Task>,
    stages: &[(String, mpsc::Sender<Batch>)],
    metrics: &CoordinatorMetrics,
) {
    if pending.is_empty() {
        return;
    }
    let batch: Batch = Arc::from(std::mem::take(pending));
    metrics.batch(batch.len());
    tracing::debug!(size = batch.len(), "dispatching batch");

    for (name, sender) in stages {
        if sender.send(batch.clone()).await.is_err() {
            tracing::warn!(stage = %name, "stage loop is gone; batch dropped for stage");
        }
    }
}

struct StageRunner {
    stage: StageSpec,
    breaker: Arc<CircuitBreaker>,
    accumulator: Arc<ResultAccumulator>,
    metrics: Arc<CoordinatorMetrics>,
    permits: Arc<Semaphore>,
}

impl StageRunner {
    async fn run(self, mut batches: mpsc::Receiver<Batch>) {
        let runner = Arc::new(self);
        while let Some(batch) = batches.recv().await {
            let mut calls = JoinSet::new();
            for task in batch.iter().cloned() {
                let Ok(permit) = runner.permits.clone().acquire_owned().await else {
                    return;
                };
                let runner = runner.clone();
                calls.spawn(async move {
                    runner.process(task).await;
                    drop(permit);
                });
            }
            while let Some(joined) = calls.join_next().await {
                if let Err(error) = joined {
                    tracing::error!(stage = %runner.stage.name, %error, "stage call task failed");
                }
            }
        }
        tracing::debug!(stage = %runner.stage.name, "stage loop exiting");
    }

    async fn process(&self, task: Task) {
        let task_id = task.id.clone();
        let outcome = self.invoke(task).await;
        let result = StageResult {
            task_id: task_id.clone(),
            stage: self.stage.name.clone(),
            outcome,
            completed_at: SystemTime::now(),
        };

        match self.accumulator.record(result) {
            RecordOutcome::Joined { degraded } => {
                self.metrics.resolved(degraded);
                tracing::trace!(task_id = %task_id, degraded, "task joined");
            }
            RecordOutcome::Partial => {}
            RecordOutcome::Orphaned => {
                self.metrics.orphaned();
                tracing::debug!(
                    task_id = %task_id,
                    stage = %self.stage.name,
                    "stage result arrived after the task was resolved"
                );
            }
        }
    }

    async fn invoke(&self, task: Task) -> StageOutcome {
        let handler = self.stage.handler.clone();
        let stage = self.stage.name.clone();
        let metrics = self.metrics.clone();

        let call = async move {
            metrics.invoked(&stage);
            match tokio::task::spawn_blocking(move || handler.handle(&stage, &task)).await {
                Ok(result) => result,
                Err(join_error) => Err(ControlError::internal(
                    Component::Coordinator,
                    format!("stage handler panicked: {join_error}"),
                )),
            }
        };

        match self.breaker.call_async(call).await {
            Ok(output) => StageOutcome::Completed(output),
            Err(error) => {
                let error = error.into_control_error();
                tracing::debug!(stage = %self.stage.name, %error, "stage call degraded");
                StageOutcome::Degraded {
                    fallback: self.stage.handler.fallback(&self.stage.name),
                    failure: StageFailure::from(&error),
                }
            }
        }
    }
}

fn shutdown_error(message: &str) -> ControlError {
    ControlError::new(Component::Coordinator, ErrorKind::Shutdown, message)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
