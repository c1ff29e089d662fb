use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Coordinator,
    Breaker,
    Governor,
    Supervisor,
    Limiter,
    Execution,
    Config,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    HandlerFailure,
    CircuitOpen,
    Timeout,
    ResourceExhausted,
    ProcessFailure,
    RateLimited,
    InvalidInput,
    Shutdown,
    SamplingFailure,
    StorageFailure,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct ControlError {
    pub component: Option<Component>,
    pub kind: ErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl ControlError {
    pub fn new(component: Component, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            component: Some(component),
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn invalid_input(component: Component, message: impl Into<String>) -> Self {
        Self::new(component, ErrorKind::InvalidInput, message)
    }

    pub fn internal(component: Component, message: impl Into<String>) -> Self {
        Self::new(component, ErrorKind::Internal, message)
    }

    /// True for errors raised before any work was scheduled.
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::RateLimited | ErrorKind::ResourceExhausted
        )
    }
}

pub type ControlResult<T> = Result<T, ControlError>;
