use crate::execution::{
    ExecutionResult, ProcessExecutor, ProcessExitStatus, ProcessSpawnRequest,
    ProcessTerminationMode, ProcessWaitFuture, RunningProcess, process_failure,
};

/// Spawns workers in their own process group so signals reach their descendants.
pub struct TokioProcessExecutor;

impl ProcessExecutor for TokioProcessExecutor {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>> {
        let mut cmd = tokio::process::Command::new(&request.command.program);
        cmd.args(&request.command.args);

        for (key, value) in &request.command.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &request.command.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(std::process::Stdio::null());
        if request.inherit_output {
            cmd.stdout(std::process::Stdio::inherit());
            cmd.stderr(std::process::Stdio::inherit());
        } else {
            cmd.stdout(std::process::Stdio::null());
            cmd.stderr(std::process::Stdio::null());
        }
        cmd.process_group(0);
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|error| {
            process_failure(format!(
                "failed to spawn worker '{}' ({}): {error}",
                request.worker_id,
                request.command.program.display()
            ))
        })?;

        let pid = child.id();
        tracing::debug!(worker_id = %request.worker_id, pid = ?pid, "worker process spawned");

        Ok(Box::new(TokioRunningProcess {
            child,
            pid,
            worker_id: request.worker_id,
        }))
    }
}

struct TokioRunningProcess {
    child: tokio::process::Child,
    pid: Option<u32>,
    worker_id: String,
}

impl RunningProcess for TokioRunningProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn try_wait(&mut self) -> ExecutionResult<Option<ProcessExitStatus>> {
        self.child
            .try_wait()
            .map(|status| status.map(exit_status))
            .map_err(|error| {
                process_failure(format!(
                    "failed to poll worker '{}': {error}",
                    self.worker_id
                ))
            })
    }

    fn terminate(&mut self, mode: ProcessTerminationMode) -> ExecutionResult<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };

        let signal = match mode {
            ProcessTerminationMode::Immediate => libc::SIGKILL,
            ProcessTerminationMode::Graceful => libc::SIGTERM,
        };

        let pgid = -(pid as libc::pid_t);
        let result = unsafe { libc::kill(pgid, signal) };

        if result != 0 {
            let os_error = std::io::Error::last_os_error();
            if os_error.raw_os_error() != Some(libc::ESRCH) {
                return Err(process_failure(format!(
                    "failed to send signal {signal} to process group {pid}: {os_error}"
                )));
            }
        }

        Ok(())
    }

    fn wait(&mut self) -> ProcessWaitFuture<'_> {
        Box::pin(async move {
            let status = self.child.wait().await.map_err(|error| {
                process_failure(format!(
                    "failed to wait for worker '{}': {error}",
                    self.worker_id
                ))
            })?;
            Ok(exit_status(status))
        })
    }
}

fn exit_status(status: std::process::ExitStatus) -> ProcessExitStatus {
    match status.code() {
        Some(code) => ProcessExitStatus::ExitCode(code),
        None => ProcessExitStatus::Terminated,
    }
}
