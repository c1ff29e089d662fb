use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::breaker::BreakerConfig;
use crate::coordinator::CoordinatorConfig;
use crate::governor::GovernorConfig;
use crate::limiter::RateLimiterConfig;
use crate::models::{Component, ControlError, ControlResult};
use crate::supervisor::SupervisorConfig;

/// Every component's settings, as loaded from one JSON document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub coordinator: CoordinatorConfig,
    pub breaker: BreakerConfig,
    /// Breaker settings for individual stages, replacing `breaker`.
    pub breaker_overrides: BTreeMap<String, BreakerConfig>,
    pub governor: GovernorConfig,
    pub supervisor: SupervisorConfig,
    pub limiter: RateLimiterConfig,
}

impl ControlPlaneConfig {
    pub fn from_json_str(raw: &str) -> ControlResult<Self> {
        let config: Self = serde_json::from_str(raw).map_err(|error| {
            ControlError::invalid_input(Component::Config, format!("invalid config JSON: {error}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> ControlResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|error| {
            ControlError::invalid_input(
                Component::Config,
                format!("failed to read config '{}': {error}", path.display()),
            )
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> ControlResult<()> {
        self.coordinator.validate()?;
        self.breaker.validate()?;
        for breaker in self.breaker_overrides.values() {
            breaker.validate()?;
        }
        self.governor.validate()?;
        self.supervisor.validate()?;
        self.limiter.validate()
    }

    pub fn to_json_pretty(&self) -> ControlResult<String> {
        serde_json::to_string_pretty(self).map_err(|error| {
            ControlError::internal(Component::Config, format!("failed to encode config: {error}"))
        })
    }
}

/// Serde helper storing a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
