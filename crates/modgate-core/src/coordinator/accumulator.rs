use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::oneshot;

use crate::models::{
    Component, ControlError, ControlResult, StageResult, Task, TaskId, TaskKind, TaskResult,
    WaitOutcome,
};

type ResultSender = oneshot::Sender<ControlResult<TaskResult>>;
type ResultReceiver = oneshot::Receiver<ControlResult<TaskResult>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RecordOutcome {
    Partial,
    Joined { degraded: bool },
    /// The task was already resolved, timed out or force-failed.
    Orphaned,
}

struct PendingTask {
    kind: TaskKind,
    submitted_at: SystemTime,
    stages: BTreeMap<String, StageResult>,
    sender: ResultSender,
}

#[derive(Default)]
struct AccumulatorState {
    pending: HashMap<TaskId, PendingTask>,
    receivers: HashMap<TaskId, ResultReceiver>,
    /// Resolution time of every result nobody has collected yet.
    resolved_at: HashMap<TaskId, Instant>,
    /// Same entries in resolution order; stale pairs are skipped on sweep.
    resolution_order: VecDeque<(TaskId, Instant)>,
    evicted: u64,
}

impl AccumulatorState {
    fn mark_resolved(&mut self, task_id: &TaskId, now: Instant) {
        if self.receivers.contains_key(task_id) {
            self.resolved_at.insert(task_id.clone(), now);
            self.resolution_order.push_back((task_id.clone(), now));
        }
    }

    fn evict_expired(&mut self, retention: Duration, now: Instant) -> usize {
        let mut evicted = 0;
        while let Some((task_id, at)) = self.resolution_order.front() {
            if now.saturating_duration_since(*at) < retention {
                break;
            }
            if self.resolved_at.get(task_id) == Some(at) {
                self.resolved_at.remove(task_id);
                self.receivers.remove(task_id);
                evicted += 1;
            }
            self.resolution_order.pop_front();
        }
        self.evicted += evicted as u64;
        evicted
    }
}

/// Per-task join point: task id -> stage name -> result.
///
/// An entry leaves `pending` exactly once, either when every required stage
/// has reported (the result is sent) or when a waiter gives up or shutdown
/// force-fails it (an error is sent, or nothing if the waiter is gone).
/// Results nobody collects are dropped once `retention` has passed.
pub(crate) struct ResultAccumulator {
    required: BTreeSet<String>,
    retention: Duration,
    state: Mutex<AccumulatorState>,
}

impl ResultAccumulator {
    pub(crate) fn new(required: impl IntoIterator<Item = String>, retention: Duration) -> Self {
        Self {
            required: required.into_iter().collect(),
            retention,
            state: Mutex::new(AccumulatorState::default()),
        }
    }

    /// Returns false when the id is already pending or holds an uncollected result.
    pub(crate) fn register(&self, task: &Task) -> bool {
        let mut state = self.lock();
        state.evict_expired(self.retention, Instant::now());
        if state.pending.contains_key(&task.id) || state.receivers.contains_key(&task.id) {
            return false;
        }

        let (sender, receiver) = oneshot::channel();
        state.pending.insert(
            task.id.clone(),
            PendingTask {
                kind: task.kind,
                submitted_at: task.submitted_at,
                stages: BTreeMap::new(),
                sender,
            },
        );
        state.receivers.insert(task.id.clone(), receiver);
        true
    }

    pub(crate) fn record(&self, result: StageResult) -> RecordOutcome {
        let mut state = self.lock();
        let Some(entry) = state.pending.get_mut(&result.task_id) else {
            return RecordOutcome::Orphaned;
        };
        entry.stages.entry(result.stage.clone()).or_insert(result.clone());

        if !self.required.iter().all(|stage| entry.stages.contains_key(stage)) {
            return RecordOutcome::Partial;
        }

        let Some(entry) = state.pending.remove(&result.task_id) else {
            return RecordOutcome::Orphaned;
        };
        let now = Instant::now();
        state.mark_resolved(&result.task_id, now);
        state.evict_expired(self.retention, now);
        drop(state);

        let joined = TaskResult {
            task_id: result.task_id,
            kind: entry.kind,
            stages: entry.stages,
            submitted_at: entry.submitted_at,
            completed_at: SystemTime::now(),
        };
        let degraded = joined.is_degraded();
        // the waiter may already have abandoned the task
        let _ = entry.sender.send(Ok(joined));
        RecordOutcome::Joined { degraded }
    }

    pub(crate) async fn wait(&self, task_id: &TaskId, timeout: Duration) -> WaitOutcome {
        let receiver = {
            let mut state = self.lock();
            state.resolved_at.remove(task_id);
            state.receivers.remove(task_id)
        };
        let Some(mut receiver) = receiver else {
            return WaitOutcome::Failed(ControlError::invalid_input(
                Component::Coordinator,
                format!("task '{task_id}' is not scheduled or is already being awaited"),
            ));
        };

        match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(Ok(result))) => WaitOutcome::Completed(result),
            Ok(Ok(Err(error))) => WaitOutcome::Failed(error),
            Ok(Err(_)) => WaitOutcome::Failed(ControlError::internal(
                Component::Coordinator,
                format!("result channel for task '{task_id}' closed without a result"),
            )),
            Err(_) => {
                self.lock().pending.remove(task_id);
                // resolved between the deadline and the removal above
                match receiver.try_recv() {
                    Ok(Ok(result)) => WaitOutcome::Completed(result),
                    Ok(Err(error)) => WaitOutcome::Failed(error),
                    Err(_) => WaitOutcome::TimedOut,
                }
            }
        }
    }

    /// Resolves every pending task with `error`; returns how many were resolved.
    pub(crate) fn fail_all(&self, error: &ControlError) -> usize {
        let drained: Vec<PendingTask> = {
            let mut state = self.lock();
            let now = Instant::now();
            let drained: Vec<(TaskId, PendingTask)> = state.pending.drain().collect();
            drained
                .into_iter()
                .map(|(task_id, entry)| {
                    state.mark_resolved(&task_id, now);
                    entry
                })
                .collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.sender.send(Err(error.clone()));
        }
        count
    }

    /// Drops a registration whose task never reached the batcher.
    pub(crate) fn discard(&self, task_id: &TaskId) {
        let mut state = self.lock();
        state.pending.remove(task_id);
        state.receivers.remove(task_id);
        state.resolved_at.remove(task_id);
    }

    /// Drops uncollected results older than the retention bound.
    pub(crate) fn evict_expired(&self) -> usize {
        self.lock().evict_expired(self.retention, Instant::now())
    }

    pub(crate) fn evicted_count(&self) -> u64 {
        self.lock().evicted
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub(crate) fn uncollected_count(&self) -> usize {
        let state = self.lock();
        state
            .receivers
            .keys()
            .filter(|id| !state.pending.contains_key(*id))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, AccumulatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
