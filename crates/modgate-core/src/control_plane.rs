use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::breaker::{BreakerRegistry, BreakerStats};
use crate::config::ControlPlaneConfig;
use crate::coordinator::{BatchCoordinator, CoordinatorStats, ShutdownReport, StageSpec};
use crate::governor::{GovernorStats, ResourceGovernor, ResourceSampler};
use crate::limiter::{CounterStore, LimiterStats, RateLimiter};
use crate::models::{ControlResult, Priority, TaskId, TaskKind, WaitOutcome};

#[derive(Clone, Debug)]
pub struct SubmitRequest {
    pub task_id: TaskId,
    pub payload: Arc<[u8]>,
    pub kind: TaskKind,
    pub priority: Priority,
    pub client_ip: String,
    pub api_key: Option<String>,
}

impl SubmitRequest {
    pub fn new(
        task_id: impl Into<TaskId>,
        payload: impl Into<Arc<[u8]>>,
        kind: TaskKind,
        client_ip: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            payload: payload.into(),
            kind,
            priority: Priority::Normal,
            client_ip: client_ip.into(),
            api_key: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Admission {
    Scheduled {
        task_id: TaskId,
        /// The governor is throttling; callers should prefer cheaper variants.
        degrade: bool,
    },
    /// The task id was already pending; nothing was scheduled.
    Duplicate { task_id: TaskId },
}

impl Admission {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::Scheduled { task_id, .. } | Self::Duplicate { task_id } => task_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ControlPlaneStats {
    pub coordinator: CoordinatorStats,
    pub breakers: Vec<BreakerStats>,
    pub governor: GovernorStats,
    pub limiter: LimiterStats,
}

/// Rate limiter, then governor, then coordinator.
pub struct ControlPlane {
    limiter: Arc<RateLimiter>,
    governor: Arc<ResourceGovernor>,
    coordinator: Arc<BatchCoordinator>,
    breakers: Arc<BreakerRegistry>,
}

impl ControlPlane {
    pub fn new(
        config: ControlPlaneConfig,
        stages: Vec<StageSpec>,
        sampler: Box<dyn ResourceSampler>,
        counters: Arc<dyn CounterStore>,
    ) -> ControlResult<Self> {
        config.validate()?;
        let breakers = config.breaker_overrides.into_iter().fold(
            BreakerRegistry::new(config.breaker),
            |registry, (name, breaker)| registry.with_override(name, breaker),
        );
        let breakers = Arc::new(breakers);
        let coordinator = BatchCoordinator::new(config.coordinator, stages, breakers.clone())?;
        let governor = ResourceGovernor::new(config.governor, sampler)?;
        let limiter = RateLimiter::new(config.limiter, counters)?;
        Ok(Self::from_components(
            Arc::new(limiter),
            Arc::new(governor),
            Arc::new(coordinator),
            breakers,
        ))
    }

    /// Wires already constructed components. `breakers` should be the registry
    /// the coordinator was built with so stats cover its stage breakers.
    pub fn from_components(
        limiter: Arc<RateLimiter>,
        governor: Arc<ResourceGovernor>,
        coordinator: Arc<BatchCoordinator>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            limiter,
            governor,
            coordinator,
            breakers,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn governor(&self) -> &Arc<ResourceGovernor> {
        &self.governor
    }

    pub fn coordinator(&self) -> &Arc<BatchCoordinator> {
        &self.coordinator
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Starts stage loops and the governor's control loop.
    pub fn start(&self) -> ControlResult<()> {
        self.coordinator.run_workers()?;
        self.governor.start();
        Ok(())
    }

    pub async fn submit(&self, request: SubmitRequest) -> ControlResult<Admission> {
        self.limiter
            .check_request(&request.client_ip, request.api_key.as_deref())
            .into_result()?;
        self.governor.admit(request.priority)?;

        let task_id = request.task_id.clone();
        let scheduled = self
            .coordinator
            .schedule(request.task_id, request.payload, request.kind)
            .await?;
        if !scheduled {
            return Ok(Admission::Duplicate { task_id });
        }
        let degrade = self.governor.throttle_level() >= self.governor.config().degrade_level;
        tracing::trace!(task_id = %task_id, priority = ?request.priority, degrade, "task admitted");
        Ok(Admission::Scheduled { task_id, degrade })
    }

    pub async fn wait(&self, task_id: &TaskId, timeout: Duration) -> WaitOutcome {
        self.coordinator.wait_for_result(task_id, timeout).await
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        let report = self.coordinator.shutdown().await;
        self.governor.stop().await;
        report
    }

    pub fn stats(&self) -> ControlPlaneStats {
        ControlPlaneStats {
            coordinator: self.coordinator.get_stats(),
            breakers: self.breakers.all_stats(),
            governor: self.governor.get_stats(),
            limiter: self.limiter.get_stats(),
        }
    }
}
