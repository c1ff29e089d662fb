use std::sync::Arc;

use crate::models::{ControlResult, StageOutput, Task};

/// A pluggable analysis step (OCR, NSFW, violence, ...).
///
/// Handlers are stateless from the coordinator's point of view and may block
/// or burn CPU; they are always invoked on the blocking pool.
pub trait TaskHandler: Send + Sync {
    fn handle(&self, stage: &str, task: &Task) -> ControlResult<StageOutput>;

    /// Value reported for this stage when the handler fails or is short-circuited.
    fn fallback(&self, _stage: &str) -> StageOutput {
        StageOutput::default()
    }
}

pub struct FnHandler<F> {
    handle: F,
    fallback: StageOutput,
}

impl<F> FnHandler<F>
where
    F: Fn(&str, &Task) -> ControlResult<StageOutput> + Send + Sync + 'static,
{
    pub fn new(handle: F) -> Self {
        Self {
            handle,
            fallback: StageOutput::default(),
        }
    }

    pub fn with_fallback(mut self, fallback: StageOutput) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn arc(handle: F) -> Arc<dyn TaskHandler> {
        Arc::new(Self::new(handle))
    }
}

impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(&str, &Task) -> ControlResult<StageOutput> + Send + Sync + 'static,
{
    fn handle(&self, stage: &str, task: &Task) -> ControlResult<StageOutput> {
        (self.handle)(stage, task)
    }

    fn fallback(&self, _stage: &str) -> StageOutput {
        self.fallback.clone()
    }
}

/// One named stage applied to every task of every batch.
#[derive(Clone)]
pub struct StageSpec {
    pub name: String,
    pub handler: Arc<dyn TaskHandler>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}
