//! Command-line interface definitions and the `ls` table renderer.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::{
    config::DEFAULT_CONFIG,
    daemon::ServiceManager,
    stats::{GpuStatsSource, format_cpu, format_memory, format_uptime},
};

pub const GREEN: &str = "\x1b[32m";
pub const RED: &str = "\x1b[31m";
pub const YELLOW: &str = "\x1b[33m";
pub const CYAN: &str = "\x1b[36m";
pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const RESET: &str = "\x1b[0m";

/// Lightweight local process supervisor.
///
/// Services are declared in a YAML file, spawned as detached processes, and
/// tracked through per-host PID files so separate invocations agree on what
/// is running.
#[derive(Debug, Parser)]
#[command(name = "pmon", version, about, long_about = None)]
pub struct Cli {
    /// Path to the service configuration file.
    #[arg(short = 'f', long, global = true, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Log verbosity (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start one or more services (all configured services when none given).
    Start {
        /// Service names or numeric ids.
        services: Vec<String>,

        /// Print the resolved command lines without spawning anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Stop one or more services (all running services when none given).
    Stop {
        /// Service names or numeric ids.
        services: Vec<String>,
    },

    /// Restart one or more services.
    Restart {
        /// Service names or numeric ids.
        services: Vec<String>,
    },

    /// Tail service logs, following new output until interrupted.
    Logs {
        /// Service names or numeric ids (all services when none given).
        services: Vec<String>,

        /// Print the recent lines and exit instead of following.
        #[arg(long)]
        no_follow: bool,

        /// Number of recent lines to print per log file.
        #[arg(short = 'n', long, default_value_t = 10)]
        lines: usize,
    },

    /// Delete rotated logs and clear the current ones.
    Flush {
        /// Service names or numeric ids (all services when none given).
        services: Vec<String>,
    },

    /// List configured services with live status and resource usage.
    Ls {
        /// Emit machine-readable JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}

/// One row of the `ls` listing.
#[derive(Debug, Serialize)]
pub struct LsRow {
    pub id: usize,
    pub name: String,
    pub pid: Option<u32>,
    pub uptime_seconds: Option<f64>,
    pub status: String,
    pub cpu_percent: f32,
    pub memory_mb: f64,
    pub gpu_memory_mb: Option<u64>,
    pub gpu_index: Option<u32>,
    pub restarts: u32,
}

/// Gathers one listing row per configured service, in declaration order.
/// Resource figures cover the whole process tree of a running service.
pub fn gather_rows(manager: &ServiceManager, gpu: &dyn GpuStatsSource) -> Vec<LsRow> {
    let mut rows = Vec::new();

    for (id, name) in manager.service_names().into_iter().enumerate() {
        let pid = manager.get_service_pid(&name);
        let tree = manager.get_process_tree_info(&name);

        let (gpu_memory_mb, gpu_index) = match pid {
            Some(leader) => {
                let mut pids = vec![leader];
                if let Some(info) = &tree {
                    pids.extend(info.children.iter().map(|c| c.pid));
                }
                let usage = gpu.gpu_usage(&pids);
                let total: u64 = usage.values().map(|u| u.memory_mb).sum();
                let index = usage.values().find_map(|u| u.gpu_index);
                if usage.is_empty() {
                    (None, None)
                } else {
                    (Some(total), index)
                }
            }
            None => (None, None),
        };

        rows.push(LsRow {
            id,
            name: name.clone(),
            pid,
            uptime_seconds: manager.get_uptime(&name),
            status: if pid.is_some() { "online" } else { "stopped" }.to_string(),
            cpu_percent: tree.as_ref().map(|t| t.totals.cpu_percent).unwrap_or(0.0),
            memory_mb: tree.as_ref().map(|t| t.totals.memory_mb).unwrap_or(0.0),
            gpu_memory_mb,
            gpu_index,
            restarts: manager.get_restarts_count(&name),
        });
    }

    rows
}

/// Renders rows as the PM2-style box table printed by `ls`.
pub fn render_ls_table(rows: &[LsRow]) -> String {
    let headers = [
        "id", "name", "pid", "uptime", "status", "cpu", "mem", "gpu mem", "gpu id", "restarts",
    ];

    let cells: Vec<[String; 10]> = rows
        .iter()
        .map(|row| {
            [
                row.id.to_string(),
                row.name.clone(),
                row.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                format_uptime(row.uptime_seconds),
                row.status.clone(),
                format_cpu(row.cpu_percent),
                format_memory(row.memory_mb),
                row.gpu_memory_mb
                    .map(format_memory_u64)
                    .unwrap_or_else(|| "-".into()),
                row.gpu_index
                    .map(|i| i.to_string())
                    .unwrap_or_else(|| "-".into()),
                row.restarts.to_string(),
            ]
        })
        .collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.len());
        }
    }

    let rule = |left: &str, mid: &str, right: &str| -> String {
        let mut line = String::from(left);
        for (i, width) in widths.iter().enumerate() {
            line.push_str(&"─".repeat(width + 2));
            line.push_str(if i + 1 == widths.len() { right } else { mid });
        }
        line.push('\n');
        line
    };

    let mut out = rule("┌", "┬", "┐");
    out.push('│');
    for (header, width) in headers.iter().zip(widths.iter().copied()) {
        out.push_str(&format!(" {BOLD}{header:<width$}{RESET} │"));
    }
    out.push('\n');
    out.push_str(&rule("├", "┼", "┤"));

    for (row, line) in rows.iter().zip(&cells) {
        out.push('│');
        for (i, (cell, width)) in line.iter().zip(widths.iter().copied()).enumerate() {
            // The status column is the only colored cell.
            if i == 4 {
                let color = if row.status == "online" { GREEN } else { RED };
                out.push_str(&format!(" {color}{cell:<width$}{RESET} │"));
            } else {
                out.push_str(&format!(" {cell:<width$} │"));
            }
        }
        out.push('\n');
    }

    out.push_str(&rule("└", "┴", "┘"));
    out
}

fn format_memory_u64(mb: u64) -> String {
    format_memory(mb as f64)
}
