//! CPU, memory and GPU sampling for running service trees.
//!
//! Samplers are enrichment only: every failure degrades to empty stats so the
//! lifecycle engine never depends on them for correctness.
use std::{collections::HashMap, process::Command, thread};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::debug;

/// CPU and memory usage aggregated over a process tree.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessStats {
    /// Sum of per-process CPU percentages across the tree.
    pub cpu_percent: f32,
    /// Resident set size across the tree, in megabytes.
    pub memory_mb: f64,
}

/// GPU usage attributed to a single process.
#[derive(Debug, Default, Clone, Copy)]
pub struct GpuUsage {
    /// GPU memory used by the process, in megabytes.
    pub memory_mb: u64,
    /// Index of the device the process runs on, when known.
    pub gpu_index: Option<u32>,
}

/// Samples CPU and memory for process trees via the OS process table.
pub struct StatsCollector {
    system: System,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    /// Creates a collector and primes the CPU counters; per-process CPU
    /// readings need two refreshes a short interval apart.
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        system.refresh_processes(ProcessesToUpdate::All, true);
        Self { system }
    }

    /// Aggregated stats for the given PIDs (a leader plus its descendants).
    /// Vanished processes contribute nothing.
    pub fn tree_stats(&self, pids: &[u32]) -> ProcessStats {
        let mut stats = ProcessStats::default();

        for pid in pids {
            if let Some(process) = self.system.process(Pid::from_u32(*pid)) {
                stats.cpu_percent += process.cpu_usage();
                stats.memory_mb += process.memory() as f64 / (1024.0 * 1024.0);
            }
        }

        stats
    }
}

/// Formats a CPU percentage the way `ls` displays it.
pub fn format_cpu(cpu_percent: f32) -> String {
    format!("{cpu_percent:.1}%")
}

/// Formats a memory amount with a unit scaled to its magnitude.
pub fn format_memory(memory_mb: f64) -> String {
    if memory_mb <= 0.0 {
        "0b".to_string()
    } else if memory_mb < 1.0 {
        format!("{}kb", (memory_mb * 1024.0) as u64)
    } else if memory_mb > 1024.0 {
        format!("{:.1}gb", memory_mb / 1024.0)
    } else {
        format!("{}mb", memory_mb as u64)
    }
}

/// Formats an uptime in seconds as a two-unit human string.
pub fn format_uptime(uptime_seconds: Option<f64>) -> String {
    let Some(uptime) = uptime_seconds else {
        return "-".to_string();
    };

    let seconds = uptime.max(0.0) as u64;
    let (days, rem) = (seconds / 86_400, seconds % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let (minutes, secs) = (rem / 60, rem % 60);

    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

/// Source of per-process GPU usage.
///
/// Implementations are chosen once at startup by [`probe_gpu_source`]; the
/// rest of the program only sees the trait.
pub trait GpuStatsSource {
    /// GPU usage keyed by PID, restricted to the PIDs of interest.
    fn gpu_usage(&self, pids: &[u32]) -> HashMap<u32, GpuUsage>;
}

/// Fallback source for hosts without GPU tooling; always empty.
pub struct NoneSource;

impl GpuStatsSource for NoneSource {
    fn gpu_usage(&self, _pids: &[u32]) -> HashMap<u32, GpuUsage> {
        HashMap::new()
    }
}

/// GPU source that shells out to `nvidia-smi`.
pub struct ShellToolSource;

impl GpuStatsSource for ShellToolSource {
    fn gpu_usage(&self, pids: &[u32]) -> HashMap<u32, GpuUsage> {
        let apps = match run_query(&[
            "--query-compute-apps=pid,gpu_uuid,used_memory",
            "--format=csv,noheader,nounits",
        ]) {
            Some(output) => output,
            None => return HashMap::new(),
        };

        let index_by_uuid = run_query(&["--query-gpu=uuid,index", "--format=csv,noheader"])
            .map(|output| parse_gpu_index_map(&output))
            .unwrap_or_default();

        let mut usage = HashMap::new();
        for (pid, uuid, memory_mb) in parse_compute_apps(&apps) {
            if pids.contains(&pid) {
                usage.insert(
                    pid,
                    GpuUsage {
                        memory_mb,
                        gpu_index: index_by_uuid.get(&uuid).copied(),
                    },
                );
            }
        }

        usage
    }
}

/// Picks a GPU source by capability probing: `nvidia-smi` when present and
/// responsive, otherwise the empty source.
pub fn probe_gpu_source() -> Box<dyn GpuStatsSource> {
    match Command::new("nvidia-smi").arg("--version").output() {
        Ok(output) if output.status.success() => {
            debug!("nvidia-smi detected; GPU stats enabled");
            Box::new(ShellToolSource)
        }
        _ => Box::new(NoneSource),
    }
}

fn run_query(args: &[&str]) -> Option<String> {
    let output = Command::new("nvidia-smi").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok()
}

/// Parses `pid, gpu_uuid, used_memory` CSV rows from `nvidia-smi`.
fn parse_compute_apps(output: &str) -> Vec<(u32, String, u64)> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let pid = fields.next()?.parse().ok()?;
            let uuid = fields.next()?.to_string();
            let memory_mb = fields.next()?.parse().ok()?;
            Some((pid, uuid, memory_mb))
        })
        .collect()
}

/// Parses `uuid, index` CSV rows from `nvidia-smi`.
fn parse_gpu_index_map(output: &str) -> HashMap<String, u32> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let uuid = fields.next()?.to_string();
            let index = fields.next()?.parse().ok()?;
            Some((uuid, index))
        })
        .collect()
}
