mod policy;

pub use policy::{RestartDecision, RestartPolicy, StopReason};

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::execution::{
    CommandSpec, ProcessExecutor, ProcessExitStatus, ProcessSpawnRequest, RunningProcess,
    spawn_validated, terminate_gracefully,
};
use crate::models::{Component, ControlError, ControlResult};

pub const WORKER_ID_ENV: &str = "MODGATE_WORKER_ID";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub num_workers: usize,
    /// Command launched for every worker; `None` disables supervision.
    pub command: Option<CommandSpec>,
    pub worker_id_prefix: String,
    pub max_restarts: u32,
    pub crash_loop_threshold: usize,
    #[serde(rename = "crash_loop_window_ms", with = "crate::config::duration_ms")]
    pub crash_loop_window: Duration,
    #[serde(rename = "health_check_interval_ms", with = "crate::config::duration_ms")]
    pub health_check_interval: Duration,
    #[serde(rename = "stop_timeout_ms", with = "crate::config::duration_ms")]
    pub stop_timeout: Duration,
    pub crash_history_limit: usize,
    pub inherit_output: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            command: None,
            worker_id_prefix: "worker".to_string(),
            max_restarts: 5,
            crash_loop_threshold: 3,
            crash_loop_window: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
            crash_history_limit: 20,
            inherit_output: true,
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> ControlResult<()> {
        if let Some(command) = &self.command {
            command.validate()?;
        }
        if self.worker_id_prefix.is_empty() {
            return Err(ControlError::invalid_input(
                Component::Supervisor,
                "worker_id_prefix must not be empty",
            ));
        }
        if self.crash_loop_threshold == 0 {
            return Err(ControlError::invalid_input(
                Component::Supervisor,
                "crash_loop_threshold must be greater than zero",
            ));
        }
        if self.crash_history_limit < self.crash_loop_threshold {
            return Err(ControlError::invalid_input(
                Component::Supervisor,
                format!(
                    "crash_history_limit ({}) must be at least crash_loop_threshold ({})",
                    self.crash_history_limit, self.crash_loop_threshold
                ),
            ));
        }
        if self.health_check_interval.is_zero() || self.stop_timeout.is_zero() {
            return Err(ControlError::invalid_input(
                Component::Supervisor,
                "health_check_interval and stop_timeout must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.max_restarts,
            crash_loop_threshold: self.crash_loop_threshold,
            crash_loop_window: self.crash_loop_window,
        }
    }

    fn worker_ids(&self) -> Vec<String> {
        (0..self.num_workers)
            .map(|index| format!("{}-{index}", self.worker_id_prefix))
            .collect()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Stopped,
    Running,
    Crashed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CrashRecord {
    pub timestamp: SystemTime,
    pub reason: String,
    pub uptime_ms: u64,
    pub exit_code: Option<i32>,
    #[serde(skip)]
    occurred_at: Instant,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub crash_count: u64,
    pub uptime_ms: u64,
    pub total_uptime_ms: u64,
    pub failure_reason: Option<StopReason>,
    pub recent_crashes: Vec<CrashRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SupervisorStatus {
    pub running: bool,
    pub uptime_ms: u64,
    pub total_workers: usize,
    pub running_workers: usize,
    pub failed_workers: usize,
    pub total_restarts: u64,
    pub total_crashes: u64,
    pub workers: Vec<WorkerStatus>,
}

/// A live worker as seen by consumers that dispatch work to it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RunningWorker {
    pub worker_id: String,
    pub pid: Option<u32>,
}

struct WorkerEntry {
    id: String,
    state: WorkerState,
    process: Option<Box<dyn RunningProcess>>,
    pid: Option<u32>,
    started_at: Option<Instant>,
    restart_count: u32,
    crash_count: u64,
    crashes: VecDeque<CrashRecord>,
    total_uptime: Duration,
    intentionally_stopped: bool,
    failure_reason: Option<StopReason>,
}

impl WorkerEntry {
    fn new(id: String) -> Self {
        Self {
            id,
            state: WorkerState::Stopped,
            process: None,
            pid: None,
            started_at: None,
            restart_count: 0,
            crash_count: 0,
            crashes: VecDeque::new(),
            total_uptime: Duration::ZERO,
            intentionally_stopped: false,
            failure_reason: None,
        }
    }

    /// Closes the current run and returns its length.
    fn close_run(&mut self) -> Duration {
        let uptime = self
            .started_at
            .take()
            .map(|started| started.elapsed())
            .unwrap_or_default();
        self.total_uptime += uptime;
        self.pid = None;
        uptime
    }

    fn status(&self) -> WorkerStatus {
        let uptime = self
            .started_at
            .map(|started| started.elapsed())
            .unwrap_or_default();
        WorkerStatus {
            worker_id: self.id.clone(),
            state: self.state,
            pid: self.pid,
            restart_count: self.restart_count,
            crash_count: self.crash_count,
            uptime_ms: millis(uptime),
            total_uptime_ms: millis(self.total_uptime + uptime),
            failure_reason: self.failure_reason,
            recent_crashes: self.crashes.iter().cloned().collect(),
        }
    }
}

/// The process table lock is held only for bookkeeping and non-blocking
/// spawn or poll calls; waiting for an exit happens outside it.
pub struct WorkerSupervisor {
    config: SupervisorConfig,
    policy: RestartPolicy,
    executor: Arc<dyn ProcessExecutor>,
    workers: Mutex<BTreeMap<String, WorkerEntry>>,
    started_at: Mutex<Option<Instant>>,
    stop_signal: Arc<Notify>,
    health_loop: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerSupervisor {
    pub fn new(config: SupervisorConfig, executor: Arc<dyn ProcessExecutor>) -> ControlResult<Self> {
        config.validate()?;
        let workers = config
            .worker_ids()
            .into_iter()
            .map(|id| (id.clone(), WorkerEntry::new(id)))
            .collect();
        Ok(Self {
            policy: config.restart_policy(),
            config,
            executor,
            workers: Mutex::new(workers),
            started_at: Mutex::new(None),
            stop_signal: Arc::new(Notify::new()),
            health_loop: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Launches every stopped worker and the health-check loop.
    pub fn start(self: &Arc<Self>) -> ControlResult<()> {
        if self.config.command.is_none() {
            return Err(ControlError::invalid_input(
                Component::Supervisor,
                "no worker command configured",
            ));
        }
        let mut health_loop = lock(&self.health_loop);
        if health_loop.as_ref().is_some_and(|handle| !handle.is_finished()) {
            tracing::debug!("supervisor already running");
            return Ok(());
        }

        {
            let mut workers = lock(&self.workers);
            for entry in workers.values_mut() {
                if entry.state == WorkerState::Running {
                    continue;
                }
                entry.intentionally_stopped = false;
                entry.failure_reason = None;
                if let Err(error) = self.launch(entry) {
                    self.recover(entry, error.message, None);
                }
            }
        }
        *lock(&self.started_at) = Some(Instant::now());

        let supervisor = Arc::clone(self);
        let stop_signal = Arc::clone(&self.stop_signal);
        let period = self.config.health_check_interval;
        *health_loop = Some(tokio::spawn(async move {
            // workers were just launched; the first pass is one period out
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_signal.notified() => break,
                    _ = interval.tick() => {
                        supervisor.check_workers();
                    }
                }
            }
            tracing::debug!("supervisor health loop stopped");
        }));
        tracing::info!(
            workers = self.config.num_workers,
            interval_ms = millis(period),
            "worker supervisor started"
        );
        Ok(())
    }

    /// One health pass. Returns how many dead workers were found.
    pub fn check_workers(&self) -> usize {
        let mut workers = lock(&self.workers);
        let mut deaths = 0;
        for entry in workers.values_mut() {
            if entry.state != WorkerState::Running {
                continue;
            }
            let Some(process) = entry.process.as_mut() else {
                continue;
            };
            match process.try_wait() {
                Ok(None) => {}
                Ok(Some(status)) => {
                    deaths += 1;
                    entry.process = None;
                    self.recover(entry, describe_exit(status), status.code());
                }
                Err(error) => {
                    tracing::warn!(worker_id = %entry.id, error = %error, "worker liveness probe failed");
                }
            }
        }
        deaths
    }

    /// Stops the health loop and every worker, waiting up to `stop_timeout` per worker.
    pub async fn stop(&self) {
        let health_loop = lock(&self.health_loop).take();
        if let Some(handle) = health_loop {
            self.stop_signal.notify_one();
            if let Err(error) = handle.await {
                tracing::error!(error = ?error, "supervisor health loop ended abnormally");
            }
        }

        let processes: Vec<(String, Box<dyn RunningProcess>)> = {
            let mut workers = lock(&self.workers);
            workers
                .values_mut()
                .filter_map(|entry| {
                    entry.intentionally_stopped = true;
                    let process = entry.process.take()?;
                    entry.close_run();
                    entry.state = WorkerState::Stopped;
                    Some((entry.id.clone(), process))
                })
                .collect()
        };

        let mut stopping = JoinSet::new();
        for (worker_id, mut process) in processes {
            let grace = self.config.stop_timeout;
            stopping.spawn(async move {
                let result = terminate_gracefully(process.as_mut(), grace).await;
                (worker_id, result)
            });
        }
        while let Some(joined) = stopping.join_next().await {
            match joined {
                Ok((worker_id, Ok(status))) => {
                    tracing::info!(worker_id = %worker_id, exit_code = ?status.code(), "worker stopped");
                }
                Ok((worker_id, Err(error))) => {
                    tracing::warn!(worker_id = %worker_id, error = %error, "worker did not stop cleanly");
                }
                Err(error) => {
                    tracing::error!(error = ?error, "worker stop task failed");
                }
            }
        }
        *lock(&self.started_at) = None;
        tracing::info!("worker supervisor stopped");
    }

    /// Operator restart: stops the worker if alive, clears its restart budget
    /// and crash history, and launches it again. Revives failed workers.
    pub async fn restart_worker(&self, worker_id: &str) -> ControlResult<()> {
        let process = {
            let mut workers = lock(&self.workers);
            let entry = workers
                .get_mut(worker_id)
                .ok_or_else(|| unknown_worker(worker_id))?;
            entry.intentionally_stopped = true;
            let process = entry.process.take();
            entry.close_run();
            entry.state = WorkerState::Stopped;
            process
        };

        if let Some(mut process) = process
            && let Err(error) = terminate_gracefully(process.as_mut(), self.config.stop_timeout).await
        {
            tracing::warn!(worker_id, error = %error, "worker did not stop cleanly before restart");
        }

        let mut workers = lock(&self.workers);
        let entry = workers
            .get_mut(worker_id)
            .ok_or_else(|| unknown_worker(worker_id))?;
        entry.intentionally_stopped = false;
        entry.restart_count = 0;
        entry.crashes.clear();
        entry.failure_reason = None;
        self.launch(entry)?;
        tracing::info!(worker_id, pid = ?entry.pid, "worker restarted by operator");
        Ok(())
    }

    pub fn get_status(&self) -> SupervisorStatus {
        let workers: Vec<WorkerStatus> = lock(&self.workers).values().map(WorkerEntry::status).collect();
        let uptime = lock(&self.started_at)
            .map(|started| started.elapsed())
            .unwrap_or_default();
        SupervisorStatus {
            running: self.is_running(),
            uptime_ms: millis(uptime),
            total_workers: workers.len(),
            running_workers: workers
                .iter()
                .filter(|worker| worker.state == WorkerState::Running)
                .count(),
            failed_workers: workers
                .iter()
                .filter(|worker| worker.state == WorkerState::Failed)
                .count(),
            total_restarts: workers.iter().map(|worker| u64::from(worker.restart_count)).sum(),
            total_crashes: workers.iter().map(|worker| worker.crash_count).sum(),
            workers,
        }
    }

    pub fn worker_status(&self, worker_id: &str) -> Option<WorkerStatus> {
        lock(&self.workers).get(worker_id).map(WorkerEntry::status)
    }

    pub fn running_workers(&self) -> Vec<RunningWorker> {
        lock(&self.workers)
            .values()
            .filter(|entry| entry.state == WorkerState::Running)
            .map(|entry| RunningWorker {
                worker_id: entry.id.clone(),
                pid: entry.pid,
            })
            .collect()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.health_loop)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn launch(&self, entry: &mut WorkerEntry) -> ControlResult<()> {
        let command = self
            .config
            .command
            .clone()
            .ok_or_else(|| ControlError::invalid_input(Component::Supervisor, "no worker command configured"))?
            .env(WORKER_ID_ENV, entry.id.clone());
        let request = ProcessSpawnRequest::new(entry.id.clone(), command)
            .inherit_output(self.config.inherit_output);
        let process = spawn_validated(self.executor.as_ref(), request)?;

        entry.pid = process.pid();
        entry.process = Some(process);
        entry.started_at = Some(Instant::now());
        entry.state = WorkerState::Running;
        Ok(())
    }

    /// Records a death and applies the restart policy until the worker is
    /// running again or terminally failed. Spawn failures count as crashes.
    fn recover(&self, entry: &mut WorkerEntry, mut reason: String, mut exit_code: Option<i32>) {
        loop {
            let now = Instant::now();
            let uptime = entry.close_run();
            entry.state = WorkerState::Crashed;
            entry.crash_count += 1;
            entry.crashes.push_back(CrashRecord {
                timestamp: SystemTime::now(),
                reason: reason.clone(),
                uptime_ms: millis(uptime),
                exit_code,
                occurred_at: now,
            });
            while entry.crashes.len() > self.config.crash_history_limit {
                entry.crashes.pop_front();
            }
            tracing::warn!(
                worker_id = %entry.id,
                reason = %reason,
                exit_code = ?exit_code,
                uptime_ms = millis(uptime),
                "worker crashed"
            );

            let decision = self.policy.evaluate(
                entry.intentionally_stopped,
                entry.restart_count,
                entry.crashes.iter().map(|crash| crash.occurred_at),
                now,
            );
            match decision {
                RestartDecision::Stop(stop_reason) => {
                    entry.state = WorkerState::Failed;
                    entry.failure_reason = Some(stop_reason);
                    tracing::error!(
                        worker_id = %entry.id,
                        reason = ?stop_reason,
                        restart_count = entry.restart_count,
                        "worker will not be restarted"
                    );
                    return;
                }
                RestartDecision::Restart => {
                    entry.restart_count += 1;
                    match self.launch(entry) {
                        Ok(()) => {
                            tracing::info!(
                                worker_id = %entry.id,
                                pid = ?entry.pid,
                                restart_count = entry.restart_count,
                                "worker restarted"
                            );
                            return;
                        }
                        Err(error) => {
                            reason = error.message;
                            exit_code = None;
                        }
                    }
                }
            }
        }
    }
}

fn describe_exit(status: ProcessExitStatus) -> String {
    match status {
        ProcessExitStatus::ExitCode(code) => format!("exited with code {code}"),
        ProcessExitStatus::Terminated => "terminated by signal".to_string(),
    }
}

fn unknown_worker(worker_id: &str) -> ControlError {
    ControlError::invalid_input(Component::Supervisor, format!("unknown worker '{worker_id}'"))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
