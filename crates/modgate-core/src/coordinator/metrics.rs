use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

const BATCH_SIZE_HISTORY: usize = 100;

#[derive(Default)]
pub(crate) struct CoordinatorMetrics {
    scheduled: AtomicU64,
    duplicates: AtomicU64,
    resolved: AtomicU64,
    degraded: AtomicU64,
    timed_out: AtomicU64,
    orphaned_results: AtomicU64,
    batches: AtomicU64,
    batch_sizes: Mutex<VecDeque<usize>>,
    invocations: Mutex<BTreeMap<String, u64>>,
}

impl CoordinatorMetrics {
    pub(crate) fn scheduled(&self) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn resolved(&self, degraded: bool) {
        self.resolved.fetch_add(1, Ordering::Relaxed);
        if degraded {
            self.degraded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn orphaned(&self) {
        self.orphaned_results.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn batch(&self, size: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        let mut sizes = self
            .batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if sizes.len() == BATCH_SIZE_HISTORY {
            sizes.pop_front();
        }
        sizes.push_back(size);
    }

    pub(crate) fn invoked(&self, stage: &str) {
        let mut invocations = self
            .invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *invocations.entry(stage.to_string()).or_default() += 1;
    }

    pub(crate) fn invocations_for(&self, stage: &str) -> u64 {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stage)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn snapshot(
        &self,
        pending: usize,
        uncollected: usize,
        evicted: u64,
    ) -> CoordinatorStats {
        CoordinatorStats {
            tasks_scheduled: self.scheduled.load(Ordering::Relaxed),
            duplicates_ignored: self.duplicates.load(Ordering::Relaxed),
            tasks_resolved: self.resolved.load(Ordering::Relaxed),
            tasks_degraded: self.degraded.load(Ordering::Relaxed),
            tasks_timed_out: self.timed_out.load(Ordering::Relaxed),
            orphaned_results: self.orphaned_results.load(Ordering::Relaxed),
            batches_dispatched: self.batches.load(Ordering::Relaxed),
            recent_batch_sizes: self
                .batch_sizes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .copied()
                .collect(),
            stage_invocations: self
                .invocations
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            pending_tasks: pending,
            uncollected_results: uncollected,
            results_evicted: evicted,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CoordinatorStats {
    pub tasks_scheduled: u64,
    pub duplicates_ignored: u64,
    pub tasks_resolved: u64,
    pub tasks_degraded: u64,
    pub tasks_timed_out: u64,
    pub orphaned_results: u64,
    pub batches_dispatched: u64,
    pub recent_batch_sizes: Vec<usize>,
    pub stage_invocations: BTreeMap<String, u64>,
    pub pending_tasks: usize,
    pub uncollected_results: usize,
    pub results_evicted: u64,
}
