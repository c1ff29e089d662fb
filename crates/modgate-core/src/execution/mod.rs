use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::models::{Component, ControlError, ControlResult, ErrorKind};

#[cfg(unix)]
pub mod tokio_process;

#[cfg(unix)]
pub use tokio_process::TokioProcessExecutor;

pub type ExecutionResult<T> = ControlResult<T>;

pub type ProcessWaitFuture<'a> =
    Pin<Box<dyn Future<Output = ExecutionResult<ProcessExitStatus>> + Send + 'a>>;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    pub fn validate(&self) -> ExecutionResult<()> {
        if self.program.as_os_str().is_empty() {
            return Err(invalid_input("command program path must not be empty"));
        }

        if self
            .args
            .iter()
            .any(|arg| arg.is_empty() || arg.contains('\0'))
        {
            return Err(invalid_input(
                "command args must be non-empty and must not contain NUL bytes",
            ));
        }

        if self
            .env
            .iter()
            .any(|(key, value)| key.is_empty() || key.contains('\0') || value.contains('\0'))
        {
            return Err(invalid_input(
                "environment keys and values must be non-empty and must not contain NUL bytes",
            ));
        }

        Ok(())
    }
}

/// One launch of a supervised worker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessSpawnRequest {
    pub worker_id: String,
    pub command: CommandSpec,
    /// Share the supervisor's stdout/stderr instead of discarding worker output.
    pub inherit_output: bool,
    pub requested_at: SystemTime,
}

impl ProcessSpawnRequest {
    pub fn new(worker_id: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            worker_id: worker_id.into(),
            command,
            inherit_output: false,
            requested_at: SystemTime::now(),
        }
    }

    pub fn inherit_output(mut self, inherit_output: bool) -> Self {
        self.inherit_output = inherit_output;
        self
    }

    pub fn validate(&self) -> ExecutionResult<()> {
        if self.worker_id.is_empty() {
            return Err(invalid_input("worker id must not be empty"));
        }
        self.command.validate()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessTerminationMode {
    Graceful,
    Immediate,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ProcessExitStatus {
    ExitCode(i32),
    Terminated,
}

impl ProcessExitStatus {
    pub fn code(self) -> Option<i32> {
        match self {
            Self::ExitCode(code) => Some(code),
            Self::Terminated => None,
        }
    }
}

pub trait RunningProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking liveness probe: `Some` once the process has exited.
    fn try_wait(&mut self) -> ExecutionResult<Option<ProcessExitStatus>>;

    fn terminate(&mut self, mode: ProcessTerminationMode) -> ExecutionResult<()>;

    fn wait(&mut self) -> ProcessWaitFuture<'_>;
}

pub trait ProcessExecutor: Send + Sync {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>>;
}

pub fn spawn_validated(
    executor: &dyn ProcessExecutor,
    request: ProcessSpawnRequest,
) -> ExecutionResult<Box<dyn RunningProcess>> {
    request.validate()?;
    executor.spawn(request)
}

/// Asks the process to exit, waits up to `grace_period`, then kills it.
pub async fn terminate_gracefully(
    process: &mut dyn RunningProcess,
    grace_period: Duration,
) -> ExecutionResult<ProcessExitStatus> {
    if let Some(status) = process.try_wait()? {
        return Ok(status);
    }
    process.terminate(ProcessTerminationMode::Graceful)?;
    match tokio::time::timeout(grace_period, process.wait()).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                pid = ?process.pid(),
                grace_ms = grace_period.as_millis() as u64,
                "worker ignored graceful termination; killing"
            );
            process.terminate(ProcessTerminationMode::Immediate)?;
            match tokio::time::timeout(Duration::from_secs(1), process.wait()).await {
                Ok(result) => result,
                Err(_) => Ok(ProcessExitStatus::Terminated),
            }
        }
    }
}

pub(crate) fn process_failure(message: impl Into<String>) -> ControlError {
    ControlError::new(Component::Execution, ErrorKind::ProcessFailure, message)
}

fn invalid_input(message: &str) -> ControlError {
    ControlError::invalid_input(Component::Execution, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_nul_bytes_and_empty_program() {
        assert!(CommandSpec::new("").validate().is_err());
        assert!(CommandSpec::new("/bin/true").arg("a\0b").validate().is_err());
        assert!(
            CommandSpec::new("/bin/true")
                .env("KEY", "bad\0value")
                .validate()
                .is_err()
        );
        assert!(CommandSpec::new("/bin/true").arg("--flag").validate().is_ok());
    }

    #[test]
    fn spawn_request_requires_worker_id() {
        let request = ProcessSpawnRequest::new("", CommandSpec::new("/bin/true"));
        assert!(request.validate().is_err());
    }
}
