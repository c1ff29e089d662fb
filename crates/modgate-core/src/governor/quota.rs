use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::models::Priority;

/// Per-worker ceiling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceQuota {
    pub max_cpu_percent: f64,
    pub max_memory_mb: f64,
    pub max_concurrent_jobs: u32,
    /// Least urgent priority this worker serves.
    pub priority: Priority,
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self {
            max_cpu_percent: 90.0,
            max_memory_mb: 2048.0,
            max_concurrent_jobs: 4,
            priority: Priority::Background,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkerResourceTracker {
    pub worker_id: String,
    pub quota: ResourceQuota,
    pub active_jobs: u32,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub jobs_allocated: u64,
}

impl WorkerResourceTracker {
    fn new(worker_id: String, quota: ResourceQuota) -> Self {
        Self {
            worker_id,
            quota,
            active_jobs: 0,
            cpu_percent: 0.0,
            memory_mb: 0.0,
            jobs_allocated: 0,
        }
    }

    pub fn serves(&self, priority: Priority) -> bool {
        priority <= self.quota.priority
    }

    pub fn is_under_ceiling(&self) -> bool {
        self.active_jobs < self.quota.max_concurrent_jobs
            && self.cpu_percent < self.quota.max_cpu_percent
            && self.memory_mb < self.quota.max_memory_mb
    }

    /// Smallest remaining fraction among job slots, CPU and memory.
    pub fn spare_capacity(&self) -> f64 {
        let jobs = 1.0 - f64::from(self.active_jobs) / f64::from(self.quota.max_concurrent_jobs.max(1));
        let cpu = 1.0 - self.cpu_percent / self.quota.max_cpu_percent.max(f64::EPSILON);
        let memory = 1.0 - self.memory_mb / self.quota.max_memory_mb.max(f64::EPSILON);
        jobs.min(cpu).min(memory).max(0.0)
    }
}

#[derive(Debug, Default)]
pub(crate) struct WorkerRegistry {
    workers: Mutex<HashMap<String, WorkerResourceTracker>>,
}

impl WorkerRegistry {
    pub(crate) fn register(&self, worker_id: &str, quota: ResourceQuota) {
        self.lock()
            .entry(worker_id.to_string())
            .and_modify(|tracker| tracker.quota = quota.clone())
            .or_insert_with(|| WorkerResourceTracker::new(worker_id.to_string(), quota));
    }

    pub(crate) fn unregister(&self, worker_id: &str) -> bool {
        self.lock().remove(worker_id).is_some()
    }

    pub(crate) fn update_usage(&self, worker_id: &str, cpu_percent: f64, memory_mb: f64) -> bool {
        match self.lock().get_mut(worker_id) {
            Some(tracker) => {
                tracker.cpu_percent = cpu_percent;
                tracker.memory_mb = memory_mb;
                true
            }
            None => false,
        }
    }

    /// Picks the eligible worker with the most spare capacity and takes a job slot on it.
    pub(crate) fn acquire(&self, priority: Priority) -> Option<(String, f64)> {
        let mut workers = self.lock();
        let chosen = workers
            .values()
            .filter(|tracker| tracker.serves(priority) && tracker.is_under_ceiling())
            .max_by(|a, b| {
                a.spare_capacity()
                    .total_cmp(&b.spare_capacity())
                    // stable choice between equals
                    .then_with(|| b.worker_id.cmp(&a.worker_id))
            })
            .map(|tracker| (tracker.worker_id.clone(), tracker.spare_capacity()))?;

        let tracker = workers.get_mut(&chosen.0)?;
        tracker.active_jobs += 1;
        tracker.jobs_allocated += 1;
        Some(chosen)
    }

    pub(crate) fn release(&self, worker_id: &str) -> bool {
        match self.lock().get_mut(worker_id) {
            Some(tracker) if tracker.active_jobs > 0 => {
                tracker.active_jobs -= 1;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<WorkerResourceTracker> {
        let mut workers: Vec<_> = self.lock().values().cloned().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, WorkerResourceTracker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota(max_jobs: u32) -> ResourceQuota {
        ResourceQuota {
            max_concurrent_jobs: max_jobs,
            ..ResourceQuota::default()
        }
    }

    #[test]
    fn picks_worker_with_most_spare_capacity() {
        let registry = WorkerRegistry::default();
        registry.register("a", quota(4));
        registry.register("b", quota(4));
        registry.update_usage("a", 60.0, 100.0);
        registry.update_usage("b", 10.0, 100.0);

        let (worker, _) = registry.acquire(Priority::Normal).expect("a worker is free");
        assert_eq!(worker, "b");
    }

    #[test]
    fn workers_at_their_ceiling_are_skipped() {
        let registry = WorkerRegistry::default();
        registry.register("a", quota(1));

        assert!(registry.acquire(Priority::Normal).is_some());
        assert!(registry.acquire(Priority::Normal).is_none());
        assert!(registry.release("a"));
        assert!(registry.acquire(Priority::Normal).is_some());
    }

    #[test]
    fn reserved_workers_only_serve_urgent_priorities() {
        let registry = WorkerRegistry::default();
        registry.register(
            "reserved",
            ResourceQuota {
                priority: Priority::High,
                ..ResourceQuota::default()
            },
        );

        assert!(registry.acquire(Priority::Low).is_none());
        assert!(registry.acquire(Priority::Critical).is_some());
    }

    #[test]
    fn release_never_underflows() {
        let registry = WorkerRegistry::default();
        registry.register("a", quota(2));
        assert!(!registry.release("a"));
        assert!(!registry.release("missing"));
    }
}
