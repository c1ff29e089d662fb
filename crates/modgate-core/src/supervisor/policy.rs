use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    IntentionalStop,
    MaxRestarts,
    CrashLoop,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestartDecision {
    Restart,
    Stop(StopReason),
}

/// Whether a dead worker comes back. Every stop condition is terminal on its own.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub crash_loop_threshold: usize,
    pub crash_loop_window: Duration,
}

impl RestartPolicy {
    /// `crash_times` must already include the crash being evaluated.
    pub fn evaluate<I>(
        &self,
        intentionally_stopped: bool,
        restart_count: u32,
        crash_times: I,
        now: Instant,
    ) -> RestartDecision
    where
        I: IntoIterator<Item = Instant>,
    {
        if intentionally_stopped {
            return RestartDecision::Stop(StopReason::IntentionalStop);
        }
        if restart_count >= self.max_restarts {
            return RestartDecision::Stop(StopReason::MaxRestarts);
        }
        let recent = crash_times
            .into_iter()
            .filter(|at| now.saturating_duration_since(*at) <= self.crash_loop_window)
            .count();
        if recent >= self.crash_loop_threshold {
            return RestartDecision::Stop(StopReason::CrashLoop);
        }
        RestartDecision::Restart
    }
}
