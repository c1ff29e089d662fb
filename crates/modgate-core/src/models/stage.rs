use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::Serialize;

use crate::models::{ControlError, ErrorKind, TaskId, TaskKind};

/// Numeric scores produced by one stage for one task.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StageOutput {
    pub scores: BTreeMap<String, f64>,
}

impl StageOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn score(mut self, key: impl Into<String>, value: f64) -> Self {
        self.scores.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.scores.get(key).copied()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StageFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ControlError> for StageFailure {
    fn from(error: &ControlError) -> Self {
        Self {
            kind: error.kind,
            message: error.message.clone(),
        }
    }
}

/// A stage contribution is always present; failures carry the stage default.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Completed(StageOutput),
    Degraded {
        fallback: StageOutput,
        failure: StageFailure,
    },
}

impl StageOutcome {
    pub fn output(&self) -> &StageOutput {
        match self {
            StageOutcome::Completed(output) => output,
            StageOutcome::Degraded { fallback, .. } => fallback,
        }
    }

    pub fn failure(&self) -> Option<&StageFailure> {
        match self {
            StageOutcome::Completed(_) => None,
            StageOutcome::Degraded { failure, .. } => Some(failure),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, StageOutcome::Degraded { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StageResult {
    pub task_id: TaskId,
    pub stage: String,
    pub outcome: StageOutcome,
    pub completed_at: SystemTime,
}

/// Joined result of every required stage for one task.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub stages: BTreeMap<String, StageResult>,
    pub submitted_at: SystemTime,
    pub completed_at: SystemTime,
}

impl TaskResult {
    pub fn stage(&self, name: &str) -> Option<&StageOutcome> {
        self.stages.get(name).map(|result| &result.outcome)
    }

    pub fn is_degraded(&self) -> bool {
        self.stages.values().any(|result| result.outcome.is_degraded())
    }

    pub fn degraded_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|(_, result)| result.outcome.is_degraded())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Highest value of `key` across all stages, degraded ones included.
    pub fn max_score(&self, key: &str) -> Option<f64> {
        self.stages
            .values()
            .filter_map(|result| result.outcome.output().get(key))
            .fold(None, |acc, value| match acc {
                Some(current) if current >= value => Some(current),
                _ => Some(value),
            })
    }
}

/// What a waiter observes. A timeout is a value, not an error.
#[derive(Clone, Debug, PartialEq)]
pub enum WaitOutcome {
    Completed(TaskResult),
    Failed(ControlError),
    TimedOut,
}

impl WaitOutcome {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, WaitOutcome::TimedOut)
    }

    pub fn completed(self) -> Option<TaskResult> {
        match self {
            WaitOutcome::Completed(result) => Some(result),
            _ => None,
        }
    }
}
