pub mod error;
pub mod stage;
pub mod task;

pub use error::{Component, ControlError, ControlResult, ErrorKind};
pub use stage::{StageFailure, StageOutcome, StageOutput, StageResult, TaskResult, WaitOutcome};
pub use task::{Priority, Task, TaskId, TaskKind};
