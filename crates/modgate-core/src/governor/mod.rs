mod quota;
mod sampler;

pub use quota::{ResourceQuota, WorkerResourceTracker};
pub use sampler::{HostSampler, ProcessSampler, ResourceSample, ResourceSampler, WorkerUsage};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::models::{Component, ControlError, ControlResult, ErrorKind, Priority};
use quota::WorkerRegistry;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub cpu_target: f64,
    pub memory_target: f64,
    pub cpu_ceiling: f64,
    pub memory_ceiling: f64,
    #[serde(rename = "check_interval_ms", with = "crate::config::duration_ms")]
    pub check_interval: Duration,
    /// Largest increase of the throttle level in one tick.
    pub max_step: f64,
    /// Decrease of the throttle level per tick while both readings are at or below target.
    pub decay_step: f64,
    /// Throttle level from which admitted callers are told to degrade.
    pub degrade_level: f64,
    /// Ceiling applied to workers registered without an explicit quota.
    pub worker_quota: ResourceQuota,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            cpu_target: 70.0,
            memory_target: 80.0,
            cpu_ceiling: 95.0,
            memory_ceiling: 95.0,
            check_interval: Duration::from_secs(1),
            max_step: 0.1,
            decay_step: 0.05,
            degrade_level: 0.3,
            worker_quota: ResourceQuota::default(),
        }
    }
}

impl GovernorConfig {
    pub fn validate(&self) -> ControlResult<()> {
        let percentages = [
            ("cpu_target", self.cpu_target),
            ("memory_target", self.memory_target),
            ("cpu_ceiling", self.cpu_ceiling),
            ("memory_ceiling", self.memory_ceiling),
        ];
        for (name, value) in percentages {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ControlError::invalid_input(
                    Component::Governor,
                    format!("{name} must be within (0, 100], got {value}"),
                ));
            }
        }
        if self.cpu_target >= self.cpu_ceiling || self.memory_target >= self.memory_ceiling {
            return Err(ControlError::invalid_input(
                Component::Governor,
                "targets must be below their ceilings",
            ));
        }
        let steps = [
            ("max_step", self.max_step),
            ("decay_step", self.decay_step),
            ("degrade_level", self.degrade_level),
        ];
        for (name, value) in steps {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ControlError::invalid_input(
                    Component::Governor,
                    format!("{name} must be within (0, 1], got {value}"),
                ));
            }
        }
        if self.check_interval.is_zero() {
            return Err(ControlError::invalid_input(
                Component::Governor,
                "check_interval must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ControlState {
    throttle_level: f64,
    load_shedding: bool,
    last_sample: Option<ResourceSample>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GovernorStats {
    pub throttle_level: f64,
    pub load_shedding_active: bool,
    pub last_sample: Option<ResourceSample>,
    pub ticks: u64,
    pub sampling_errors: u64,
    pub jobs_admitted: u64,
    pub jobs_rejected: u64,
    pub workers: Vec<WorkerResourceTracker>,
}

/// Job slot on a worker. Releasing happens exactly once, on `release` or drop.
#[derive(Debug)]
pub struct WorkerLease {
    worker_id: String,
    should_throttle: bool,
    spare_capacity: f64,
    registry: Arc<WorkerRegistry>,
    released: bool,
}

impl WorkerLease {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Admitted, but the caller should run a cheaper variant of the job.
    pub fn should_throttle(&self) -> bool {
        self.should_throttle
    }

    pub fn spare_capacity(&self) -> f64 {
        self.spare_capacity
    }

    pub fn release(mut self) {
        self.release_slot();
    }

    fn release_slot(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.release(&self.worker_id);
        }
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.release_slot();
    }
}

pub struct ResourceGovernor {
    config: GovernorConfig,
    sampler: Mutex<Box<dyn ResourceSampler>>,
    state: Mutex<ControlState>,
    workers: Arc<WorkerRegistry>,
    ticks: AtomicU64,
    sampling_errors: AtomicU64,
    jobs_admitted: AtomicU64,
    jobs_rejected: AtomicU64,
    stop_signal: Arc<Notify>,
    control_loop: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceGovernor {
    pub fn new(config: GovernorConfig, sampler: Box<dyn ResourceSampler>) -> ControlResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sampler: Mutex::new(sampler),
            state: Mutex::new(ControlState::default()),
            workers: Arc::new(WorkerRegistry::default()),
            ticks: AtomicU64::new(0),
            sampling_errors: AtomicU64::new(0),
            jobs_admitted: AtomicU64::new(0),
            jobs_rejected: AtomicU64::new(0),
            stop_signal: Arc::new(Notify::new()),
            control_loop: Mutex::new(None),
        })
    }

    pub fn with_host_sampler(config: GovernorConfig) -> ControlResult<Self> {
        Self::new(config, Box::new(HostSampler::new()))
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn throttle_level(&self) -> f64 {
        lock(&self.state).throttle_level
    }

    pub fn is_load_shedding(&self) -> bool {
        lock(&self.state).load_shedding
    }

    /// Samples the host once and applies the reading. A failed sample leaves
    /// the throttle level and shedding flag untouched.
    pub fn tick(&self) -> ControlResult<ResourceSample> {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let sample = lock(&self.sampler).sample();
        match sample {
            Ok(sample) => {
                self.observe(sample);
                Ok(sample)
            }
            Err(error) => {
                self.sampling_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %error, "resource sampling failed; keeping previous throttle level");
                Err(error)
            }
        }
    }

    /// Applies one utilisation reading to the control state.
    pub fn observe(&self, sample: ResourceSample) {
        let config = &self.config;
        let cpu_overage = overage(sample.cpu_percent, config.cpu_target);
        let memory_overage = overage(sample.memory_percent, config.memory_target);

        let mut state = lock(&self.state);
        let previous = state.throttle_level;
        state.throttle_level = if cpu_overage > 0.0 || memory_overage > 0.0 {
            let step = cpu_overage.max(memory_overage).min(config.max_step);
            (previous + step).min(1.0)
        } else {
            (previous - config.decay_step).max(0.0)
        };

        let over_ceiling = sample.cpu_percent >= config.cpu_ceiling
            || sample.memory_percent >= config.memory_ceiling;
        if over_ceiling && !state.load_shedding {
            tracing::warn!(
                cpu_percent = sample.cpu_percent,
                memory_percent = sample.memory_percent,
                "resource ceiling exceeded; shedding all but critical work"
            );
        } else if !over_ceiling && state.load_shedding {
            tracing::info!(
                cpu_percent = sample.cpu_percent,
                memory_percent = sample.memory_percent,
                "resource usage back under ceilings; load shedding cleared"
            );
        }
        state.load_shedding = over_ceiling;
        state.last_sample = Some(sample);

        if (state.throttle_level - previous).abs() > f64::EPSILON {
            tracing::debug!(
                from = previous,
                to = state.throttle_level,
                cpu_percent = sample.cpu_percent,
                memory_percent = sample.memory_percent,
                "throttle level adjusted"
            );
        }
    }

    /// Admission by priority against the current throttle level.
    pub fn can_accept_job(&self, priority: Priority) -> bool {
        let state = lock(&self.state);
        admits(priority, state.throttle_level, state.load_shedding)
    }

    /// Like [`Self::can_accept_job`] but counts the decision and explains rejections.
    pub fn admit(&self, priority: Priority) -> ControlResult<()> {
        let (level, shedding) = {
            let state = lock(&self.state);
            (state.throttle_level, state.load_shedding)
        };
        if admits(priority, level, shedding) {
            self.jobs_admitted.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        self.jobs_rejected.fetch_add(1, Ordering::Relaxed);
        let message = if shedding {
            format!("load shedding active; {priority:?} work rejected")
        } else {
            format!("throttle level {level:.2} rejects {priority:?} work")
        };
        tracing::debug!(?priority, throttle_level = level, load_shedding = shedding, "job rejected");
        Err(ControlError::new(Component::Governor, ErrorKind::ResourceExhausted, message))
    }

    pub fn register_worker(&self, worker_id: &str, quota: ResourceQuota) {
        self.workers.register(worker_id, quota);
    }

    pub fn unregister_worker(&self, worker_id: &str) -> bool {
        self.workers.unregister(worker_id)
    }

    pub fn update_worker_usage(&self, worker_id: &str, cpu_percent: f64, memory_mb: f64) -> bool {
        self.workers.update_usage(worker_id, cpu_percent, memory_mb)
    }

    /// Admits `priority` and reserves a job slot on the least loaded eligible worker.
    pub fn allocate_worker(&self, priority: Priority) -> ControlResult<WorkerLease> {
        self.admit(priority)?;
        let Some((worker_id, spare_capacity)) = self.workers.acquire(priority) else {
            self.jobs_admitted.fetch_sub(1, Ordering::Relaxed);
            self.jobs_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(ControlError::new(
                Component::Governor,
                ErrorKind::ResourceExhausted,
                format!("no worker has spare capacity for {priority:?} work"),
            ));
        };
        let should_throttle = self.throttle_level() >= self.config.degrade_level;
        tracing::debug!(worker_id = %worker_id, ?priority, spare_capacity, should_throttle, "worker allocated");
        Ok(WorkerLease {
            worker_id,
            should_throttle,
            spare_capacity,
            registry: Arc::clone(&self.workers),
            released: false,
        })
    }

    /// Starts the periodic control loop. Calling it while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut control_loop = lock(&self.control_loop);
        if control_loop.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let governor = Arc::clone(self);
        let stop_signal = Arc::clone(&self.stop_signal);
        let period = self.config.check_interval;
        *control_loop = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_signal.notified() => break,
                    _ = interval.tick() => {
                        // failures are logged and counted inside tick
                        let _ = governor.tick();
                    }
                }
            }
            tracing::debug!("governor control loop stopped");
        }));
        tracing::info!(interval_ms = period.as_millis() as u64, "governor control loop started");
    }

    pub async fn stop(&self) {
        let handle = lock(&self.control_loop).take();
        if let Some(handle) = handle {
            self.stop_signal.notify_one();
            if let Err(error) = handle.await {
                tracing::error!(error = ?error, "governor control loop ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.control_loop)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn get_stats(&self) -> GovernorStats {
        let state = lock(&self.state);
        GovernorStats {
            throttle_level: state.throttle_level,
            load_shedding_active: state.load_shedding,
            last_sample: state.last_sample,
            ticks: self.ticks.load(Ordering::Relaxed),
            sampling_errors: self.sampling_errors.load(Ordering::Relaxed),
            jobs_admitted: self.jobs_admitted.load(Ordering::Relaxed),
            jobs_rejected: self.jobs_rejected.load(Ordering::Relaxed),
            workers: self.workers.snapshot(),
        }
    }
}

/// Distance above `target` as a fraction of the headroom between target and 100%.
fn overage(usage: f64, target: f64) -> f64 {
    if usage <= target {
        return 0.0;
    }
    ((usage - target) / (100.0 - target).max(1.0)).min(1.0)
}

fn admits(priority: Priority, throttle_level: f64, load_shedding: bool) -> bool {
    match priority {
        Priority::Critical => true,
        _ if load_shedding => false,
        Priority::High => throttle_level < 0.8,
        Priority::Normal => throttle_level < 0.5,
        Priority::Low => throttle_level < 0.3,
        Priority::Background => throttle_level == 0.0,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overage_is_relative_to_headroom() {
        assert_eq!(overage(60.0, 70.0), 0.0);
        assert!((overage(85.0, 70.0) - 0.5).abs() < 1e-9);
        assert_eq!(overage(100.0, 70.0), 1.0);
    }

    #[test]
    fn admission_table() {
        assert!(admits(Priority::Critical, 1.0, true));
        assert!(!admits(Priority::High, 0.0, true));
        assert!(admits(Priority::High, 0.79, false));
        assert!(!admits(Priority::High, 0.8, false));
        assert!(admits(Priority::Normal, 0.49, false));
        assert!(!admits(Priority::Normal, 0.5, false));
        assert!(admits(Priority::Low, 0.29, false));
        assert!(!admits(Priority::Low, 0.3, false));
        assert!(admits(Priority::Background, 0.0, false));
        assert!(!admits(Priority::Background, 0.05, false));
    }

    #[test]
    fn validate_rejects_target_above_ceiling() {
        let config = GovernorConfig {
            cpu_target: 96.0,
            ..GovernorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
