//! Metric sources polled by the agent.

use rand::Rng;
use sysinfo::{Pid, System};
use tracing::trace;

use crate::model::MetricSample;

const MIB: f64 = 1024.0 * 1024.0;

/// Produces one round of samples per poll tick
pub trait Collector: Send {
    fn name(&self) -> &'static str;

    fn collect(&mut self) -> Vec<MetricSample>;
}

/// Host and process figures from `sysinfo`, plus `RandomValue` and the
/// `PollCount` counter.
pub struct SystemCollector {
    system: System,
    pid: Option<Pid>,
}

impl std::fmt::Debug for SystemCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemCollector").field("pid", &self.pid).finish()
    }
}

impl SystemCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between two refreshes; prime the first one.
        system.refresh_cpu();
        Self {
            system,
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SystemCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for SystemCollector {
    fn name(&self) -> &'static str {
        "system"
    }

    fn collect(&mut self) -> Vec<MetricSample> {
        self.system.refresh_memory();
        self.system.refresh_cpu();

        let mut samples = vec![
            MetricSample::gauge("TotalMemory", self.system.total_memory() as f64 / MIB),
            MetricSample::gauge("FreeMemory", self.system.free_memory() as f64 / MIB),
        ];

        if let Some(cpu) = self.system.cpus().first() {
            samples.push(MetricSample::gauge("CPUutilization1", f64::from(cpu.cpu_usage())));
        }

        if let Some(pid) = self.pid {
            if self.system.refresh_process(pid) {
                if let Some(process) = self.system.process(pid) {
                    samples.push(MetricSample::gauge("ProcessMemory", process.memory() as f64));
                    samples.push(MetricSample::gauge("ProcessVirtualMemory", process.virtual_memory() as f64));
                }
            }
        }

        samples.push(MetricSample::gauge("RandomValue", rand::thread_rng().gen::<f64>()));
        samples.push(MetricSample::counter("PollCount", 1));

        trace!(target: "synapse::collector", samples = samples.len(), "Poll complete");
        samples
    }
}
