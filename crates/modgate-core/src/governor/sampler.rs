use serde::Serialize;
use sysinfo::{CpuExt, Pid, PidExt, ProcessExt, System, SystemExt};

use crate::models::{Component, ControlError, ControlResult, ErrorKind};

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

impl ResourceSample {
    pub fn new(cpu_percent: f64, memory_percent: f64) -> Self {
        Self {
            cpu_percent,
            memory_percent,
        }
    }
}

/// Source of host utilisation readings for the governor's control loop.
pub trait ResourceSampler: Send {
    fn sample(&mut self) -> ControlResult<ResourceSample>;
}

/// Reads global CPU and memory utilisation through `sysinfo`.
pub struct HostSampler {
    system: System,
}

impl HostSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        // the first CPU reading is only meaningful relative to a previous refresh
        system.refresh_cpu();
        Self { system }
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for HostSampler {
    fn sample(&mut self) -> ControlResult<ResourceSample> {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let total_memory = self.system.total_memory();
        if total_memory == 0 {
            return Err(sampling_failure("host reported zero total memory"));
        }

        let cpu_percent = f64::from(self.system.global_cpu_info().cpu_usage());
        let memory_percent = self.system.used_memory() as f64 / total_memory as f64 * 100.0;
        if !cpu_percent.is_finite() || !memory_percent.is_finite() {
            return Err(sampling_failure("host returned a non-finite utilisation reading"));
        }

        Ok(ResourceSample {
            cpu_percent: cpu_percent.clamp(0.0, 100.0),
            memory_percent: memory_percent.clamp(0.0, 100.0),
        })
    }
}

/// Utilisation of one worker process.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct WorkerUsage {
    /// Percent of a single core; multi-threaded workers can exceed 100.
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

/// Per-process readings for feeding worker usage into the governor.
pub struct ProcessSampler {
    system: System,
}

impl ProcessSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Returns `None` once the process is gone. CPU usage reads 0 until the
    /// second sample of the same pid.
    pub fn sample(&mut self, pid: u32) -> Option<WorkerUsage> {
        let pid = Pid::from_u32(pid);
        if !self.system.refresh_process(pid) {
            return None;
        }
        let process = self.system.process(pid)?;
        Some(WorkerUsage {
            cpu_percent: f64::from(process.cpu_usage()).max(0.0),
            memory_mb: process.memory() as f64 / (1024.0 * 1024.0),
        })
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn sampling_failure(message: &str) -> ControlError {
    ControlError::new(Component::Governor, ErrorKind::SamplingFailure, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_the_current_process() {
        let mut sampler = ProcessSampler::new();
        let usage = sampler
            .sample(std::process::id())
            .expect("own process is visible");

        assert!(usage.memory_mb > 0.0);
        assert!(usage.cpu_percent >= 0.0);
    }

    #[test]
    fn missing_process_yields_none() {
        let mut sampler = ProcessSampler::new();
        assert_eq!(sampler.sample(u32::MAX - 1), None);
    }
}
