//! On-disk runtime layout.
//!
//! State lives under `<project-dir>/.pmon/<hostname>/` so that a project
//! checked out on shared storage can be supervised from several hosts without
//! the registries trampling each other: each host reads and writes only its
//! own subtree, while `ls`-style tooling may inspect sibling host directories.
use std::{
    io,
    path::{Path, PathBuf},
};

use nix::unistd::gethostname;

/// Name of the state directory created next to the configuration file.
pub const STATE_DIR_NAME: &str = ".pmon";

/// Resolved per-host state directories.
#[derive(Debug, Clone)]
pub struct StatePaths {
    /// `<project>/.pmon/<hostname>`
    pub root: PathBuf,
    /// PID, start-time and restart-count files.
    pub pid_dir: PathBuf,
    /// Service log files.
    pub log_dir: PathBuf,
}

impl StatePaths {
    /// Layout for the current host.
    pub fn for_project(project_dir: &Path) -> Self {
        Self::for_host(project_dir, &hostname())
    }

    /// Layout for an explicit host name.
    pub fn for_host(project_dir: &Path, host: &str) -> Self {
        let root = project_dir.join(STATE_DIR_NAME).join(host);
        Self {
            pid_dir: root.join("pids"),
            log_dir: root.join("logs"),
            root,
        }
    }

    /// Creates the state directories if they do not exist yet.
    pub fn ensure(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.pid_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }
}

/// Current host name, falling back to `localhost` when unavailable.
pub fn hostname() -> String {
    gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
