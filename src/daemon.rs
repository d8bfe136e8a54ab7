//! Service lifecycle management: the process registry, spawning, liveness
//! probing, and the graceful-then-forceful shutdown protocol.
//!
//! There is no resident supervisor process. Each CLI invocation rebuilds its
//! view of the world from the on-disk registry (`{name}.pid`, `{name}.time`,
//! `{name}.restarts`) and the OS process table. PID files are advisory: they
//! are only trusted after a liveness probe, and stale entries are healed on
//! sight. The design accepts the small window in which the OS could recycle a
//! recorded PID before we reconcile it.
use std::{
    collections::{HashMap, HashSet},
    fs,
    io::ErrorKind,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::{Pid, getpgid},
};
use sysinfo::{ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, ServiceConfig},
    envsub,
    error::{RegistryError, SupervisorError},
    logs::LogManager,
    runtime::StatePaths,
    stats::{ProcessStats, StatsCollector},
};

/// How long the graceful SIGTERM phase polls before escalating.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the forceful SIGKILL phase polls before giving up.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between liveness polls while stopping.
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Timeout budgets for [`ServiceManager::stop_service_with`].
#[derive(Debug, Clone, Copy)]
pub struct StopOptions {
    /// Graceful phase budget (SIGTERM).
    pub graceful_timeout: Duration,
    /// Forceful phase budget (SIGKILL).
    pub forceful_timeout: Duration,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            graceful_timeout: DEFAULT_STOP_TIMEOUT,
            forceful_timeout: DEFAULT_KILL_TIMEOUT,
        }
    }
}

/// Optional operator escape hatch polled while only zombies remain during a
/// stop. Zombies resolve themselves once their parent reaps them, so waiting
/// out the full kill window for them is a choice, not a requirement.
pub trait StopEscape {
    /// Returns `true` when the operator asked to stop waiting.
    fn should_stop_waiting(&self) -> bool;
}

/// Escape hatch that never fires; used by non-interactive callers and tests.
pub struct NoEscape;

impl StopEscape for NoEscape {
    fn should_stop_waiting(&self) -> bool {
        false
    }
}

/// Escape hatch backed by the terminal: pressing enter stops the wait.
pub struct EnterKeyEscape;

impl StopEscape for EnterKeyEscape {
    fn should_stop_waiting(&self) -> bool {
        use crossterm::event::{self, Event, KeyCode};

        while event::poll(Duration::ZERO).unwrap_or(false) {
            if let Ok(Event::Key(key)) = event::read()
                && key.code == KeyCode::Enter
            {
                return true;
            }
        }
        false
    }
}

/// Observed state of one process during shutdown polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcState {
    Active,
    /// Terminated but unreaped; cannot be force-killed further.
    Zombie,
    Missing,
}

/// Checks whether a PID refers to a live process.
///
/// `EPERM` counts as alive: the process exists but belongs to another
/// principal, and treating it as dead could lead to a double spawn.
pub fn process_alive(pid: u32) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Discovers a process tree at this instant: the root plus all recursively
/// reachable descendants. Best-effort; processes racing to exit are skipped.
pub fn process_tree(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut tree = vec![root];
    collect_children(&system, root, &mut tree);
    tree
}

fn collect_children(system: &System, parent: u32, tree: &mut Vec<u32>) {
    for (pid, process) in system.processes() {
        if let Some(parent_pid) = process.parent()
            && parent_pid.as_u32() == parent
        {
            tree.push(pid.as_u32());
            collect_children(system, pid.as_u32(), tree);
        }
    }
}

fn proc_state(system: &System, pid: u32) -> ProcState {
    match system.process(sysinfo::Pid::from_u32(pid)) {
        None => ProcState::Missing,
        Some(process) => match process.status() {
            ProcessStatus::Zombie | ProcessStatus::Dead => ProcState::Zombie,
            _ => ProcState::Active,
        },
    }
}

/// Partitions a set of PIDs into `(active, zombie)` against a fresh snapshot
/// of the process table.
fn partition_tree(pids: &[u32]) -> (Vec<u32>, Vec<u32>) {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut active = Vec::new();
    let mut zombies = Vec::new();
    for &pid in pids {
        match proc_state(&system, pid) {
            ProcState::Active => active.push(pid),
            ProcState::Zombie => zombies.push(pid),
            ProcState::Missing => {}
        }
    }
    (active, zombies)
}

/// Per-service durable record under the host's `pids/` directory.
#[derive(Debug, Clone)]
pub struct Registry {
    pid_dir: PathBuf,
}

impl Registry {
    /// Creates a registry over an existing `pids/` directory.
    pub fn new(pid_dir: PathBuf) -> Self {
        Self { pid_dir }
    }

    fn pid_path(&self, service: &str) -> PathBuf {
        self.pid_dir.join(format!("{service}.pid"))
    }

    fn time_path(&self, service: &str) -> PathBuf {
        self.pid_dir.join(format!("{service}.time"))
    }

    fn restarts_path(&self, service: &str) -> PathBuf {
        self.pid_dir.join(format!("{service}.restarts"))
    }

    /// Reads the recorded PID without probing the OS. A corrupt file is
    /// deleted (together with its start-time sibling) and reads as absent.
    pub fn read_pid(&self, service: &str) -> Option<u32> {
        let path = self.pid_path(service);
        let content = fs::read_to_string(&path).ok()?;

        match content.trim().parse::<u32>() {
            Ok(pid) => Some(pid),
            Err(err) => {
                warn!(
                    "Corrupt PID file {} ({err}); removing stale record",
                    path.display()
                );
                let _ = fs::remove_file(&path);
                let _ = fs::remove_file(self.time_path(service));
                None
            }
        }
    }

    /// Persists a fresh leader PID and start time.
    pub fn record_start(&self, service: &str, pid: u32) -> Result<(), RegistryError> {
        fs::create_dir_all(&self.pid_dir)?;
        fs::write(self.pid_path(service), pid.to_string())?;

        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        fs::write(self.time_path(service), epoch.to_string())?;
        Ok(())
    }

    /// Removes the PID and start-time files, ignoring already-missing ones.
    /// The restart counter survives a stop.
    pub fn clear(&self, service: &str) -> Result<(), RegistryError> {
        for path in [self.pid_path(service), self.time_path(service)] {
            if let Err(err) = fs::remove_file(&path)
                && err.kind() != ErrorKind::NotFound
            {
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Recorded start time in epoch seconds, if present and well-formed.
    pub fn read_start_time(&self, service: &str) -> Option<f64> {
        let content = fs::read_to_string(self.time_path(service)).ok()?;
        content.trim().parse().ok()
    }

    /// Number of successful restarts recorded for a service.
    pub fn read_restarts(&self, service: &str) -> u32 {
        fs::read_to_string(self.restarts_path(service))
            .ok()
            .and_then(|content| content.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Increments and persists the restart counter.
    pub fn bump_restarts(&self, service: &str) -> Result<u32, RegistryError> {
        let next = self.read_restarts(service) + 1;
        fs::create_dir_all(&self.pid_dir)?;
        fs::write(self.restarts_path(service), next.to_string())?;
        Ok(next)
    }
}

/// One process within a [`ProcessTreeInfo`] snapshot.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub command: String,
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

/// Point-in-time view of a running service's process tree.
#[derive(Debug, Clone)]
pub struct ProcessTreeInfo {
    pub main: ProcessInfo,
    pub children: Vec<ProcessInfo>,
    pub totals: ProcessStats,
}

/// Interpreters whose output buffering would defeat prompt log tailing; the
/// paired variable switches them to unbuffered output.
const UNBUFFERED_INTERPRETERS: &[(&str, &str, &str)] = &[
    ("python", ".py", "PYTHONUNBUFFERED"),
    ("perl", ".pl", "PERL_UNBUFFERED"),
];

/// Detects a known script interpreter in a resolved command line and returns
/// the env var that disables its output buffering.
fn unbuffered_env(command: &str) -> Option<&'static str> {
    let first = command.split_whitespace().next()?;
    let program = Path::new(first).file_name()?.to_str()?;

    UNBUFFERED_INTERPRETERS
        .iter()
        .find(|(prefix, ext, _)| program.starts_with(prefix) || program.ends_with(ext))
        .map(|(_, _, var)| *var)
}

/// Manages services declared in one loaded configuration.
pub struct ServiceManager {
    config: Config,
    paths: StatePaths,
    registry: Registry,
    logs: LogManager,
}

impl ServiceManager {
    /// Builds a manager for the current host's state directories, creating
    /// them on first use.
    pub fn new(config: Config) -> Result<Self, SupervisorError> {
        let paths = StatePaths::for_project(&config.project_dir);
        Self::with_paths(config, paths)
    }

    /// Builds a manager over explicit state paths.
    pub fn with_paths(
        config: Config,
        paths: StatePaths,
    ) -> Result<Self, SupervisorError> {
        paths.ensure().map_err(SupervisorError::ConfigReadError)?;
        let registry = Registry::new(paths.pid_dir.clone());
        let logs = LogManager::new(paths.log_dir.clone());
        Ok(Self {
            config,
            paths,
            registry,
            logs,
        })
    }

    /// The loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The resolved state layout.
    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    /// The log engine bound to this host's log directory.
    pub fn logs(&self) -> &LogManager {
        &self.logs
    }

    /// The on-disk registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Configured service names, in declaration order.
    pub fn service_names(&self) -> Vec<String> {
        self.config.get_service_names()
    }

    /// The PID of a running service, reconciling stale records on the way.
    ///
    /// Returns `None` when no record exists or the recorded process is gone;
    /// in the latter case the PID and start-time files are removed so every
    /// later query short-circuits.
    pub fn get_service_pid(&self, service: &str) -> Option<u32> {
        let pid = self.registry.read_pid(service)?;

        if process_alive(pid) {
            Some(pid)
        } else {
            debug!("Reaping stale record for '{service}' (PID {pid} is gone)");
            if let Err(err) = self.registry.clear(service) {
                warn!("Failed to remove stale record for '{service}': {err}");
            }
            None
        }
    }

    /// Whether a service currently has a live leader process.
    pub fn is_running(&self, service: &str) -> bool {
        self.get_service_pid(service).is_some()
    }

    /// Names of all currently running services.
    pub fn running_services(&self) -> HashSet<String> {
        self.service_names()
            .into_iter()
            .filter(|name| self.is_running(name))
            .collect()
    }

    /// Uptime in seconds for a running service, clamped non-negative.
    pub fn get_uptime(&self, service: &str) -> Option<f64> {
        if !self.is_running(service) {
            return None;
        }
        let started = self.registry.read_start_time(service)?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Some((now - started).max(0.0))
    }

    /// Number of successful restarts recorded for a service.
    pub fn get_restarts_count(&self, service: &str) -> u32 {
        self.registry.read_restarts(service)
    }

    /// Environment layers for a service: process env, then `.env` values,
    /// then per-service overrides, later layers winning.
    fn layered_env(&self, service: &ServiceConfig) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.extend(self.config.dotenv.clone());
        env.extend(service.env.clone());
        env
    }

    /// Renders the fully resolved command line for a service, the way a shell
    /// would see it: `cd <dir> && KEY=VALUE ... cmd`.
    pub fn preview_command(&self, service: &str) -> Result<String, SupervisorError> {
        let config = self
            .config
            .get(service)
            .ok_or_else(|| SupervisorError::UnknownService(service.to_string()))?;

        let env = self.layered_env(config);
        let resolved = envsub::substitute(&config.cmd, &env);

        let mut rendered = String::new();
        if let Some(cwd) = &config.cwd {
            rendered.push_str(&format!("cd {cwd} && "));
        }

        let mut overrides: Vec<_> = config.env.iter().collect();
        overrides.sort();
        for (key, value) in overrides {
            rendered.push_str(&format!("{key}={value} "));
        }

        rendered.push_str(&resolved);
        Ok(rendered)
    }

    /// Starts a service as a detached process.
    ///
    /// Idempotent for running services. In dry-run mode the resolved command
    /// is logged and nothing is spawned or recorded. Spawn failures are
    /// logged and reported as `Ok(false)` with no registry mutation; only an
    /// unknown service name is a hard error.
    pub fn start_service(
        &self,
        service: &str,
        dry_run: bool,
    ) -> Result<bool, SupervisorError> {
        let config = self
            .config
            .get(service)
            .ok_or_else(|| SupervisorError::UnknownService(service.to_string()))?;

        if dry_run {
            info!("[dry-run] {}", self.preview_command(service)?);
            return Ok(true);
        }

        if self.is_running(service) {
            info!("Service '{service}' is already running");
            return Ok(true);
        }

        let env = self.layered_env(config);
        let resolved = envsub::substitute(&config.cmd, &env);

        let (stdout, stderr) = match self.logs.prepare_for_start(service, config.merge_logs)
        {
            Ok(files) => files,
            Err(err) => {
                error!("Failed to open log files for '{service}': {err}");
                return Ok(false);
            }
        };

        let cwd = config
            .cwd
            .as_ref()
            .map(|dir| self.config.project_dir.join(dir))
            .unwrap_or_else(|| self.config.project_dir.clone());

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&resolved)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        for (key, value) in &self.config.dotenv {
            cmd.env(key, value);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        // Interpreter buffering would hold output back from the log tail.
        if let Some(var) = unbuffered_env(&resolved)
            && !env.contains_key(var)
        {
            cmd.env(var, "1");
        }

        unsafe {
            cmd.pre_exec(|| {
                // New session: the service must outlive this CLI invocation
                // and never receive its terminal signals.
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        match cmd.spawn() {
            Ok(child) => {
                let pid = child.id();
                self.registry.record_start(service, pid)?;
                info!("Started service '{service}' with PID {pid}");
                Ok(true)
            }
            Err(err) => {
                error!("Failed to start service '{service}': {err}");
                Ok(false)
            }
        }
    }

    /// Stops a service with default timeouts and no interactive escape.
    pub fn stop_service(&self, service: &str) -> Result<bool, SupervisorError> {
        self.stop_service_with(service, StopOptions::default(), &NoEscape)
    }

    /// Stops a service using the two-phase shutdown protocol.
    ///
    /// Phase 1 signals SIGTERM to the leader's process group and to each tree
    /// member individually (group delivery misses descendants that moved to
    /// their own group), then polls at 1 Hz up to the graceful budget.
    /// Phase 2 escalates to SIGKILL for whatever remains and polls up to the
    /// forceful budget, distinguishing active processes from zombies. Once
    /// only zombies remain the wait can be cut short through `escape`, and
    /// leaving zombies behind still counts as success: their parent will reap
    /// them.
    ///
    /// The registry record is cleared unconditionally before returning;
    /// surviving active PIDs are reported for manual intervention and make
    /// the call return `false`.
    pub fn stop_service_with(
        &self,
        service: &str,
        options: StopOptions,
        escape: &dyn StopEscape,
    ) -> Result<bool, SupervisorError> {
        let Some(pid) = self.get_service_pid(service) else {
            info!("Service '{service}' is not running");
            return Ok(true);
        };

        let tree = process_tree(pid);
        debug!("Stopping '{service}': tree of {} process(es)", tree.len());

        signal_tree(pid, &tree, Signal::SIGTERM);

        let (mut active, mut zombies) = partition_tree(&tree);
        let graceful_polls = options.graceful_timeout.as_secs().max(1);
        for _ in 0..graceful_polls {
            if active.is_empty() {
                break;
            }
            info!(
                "Waiting for '{service}' to stop; {} process(es) remaining",
                active.len()
            );
            thread::sleep(STOP_POLL_INTERVAL);
            (active, zombies) = partition_tree(&tree);
        }

        if !active.is_empty() {
            warn!(
                "Service '{service}' ignored SIGTERM; sending SIGKILL to {} process(es)",
                active.len()
            );
            signal_tree(pid, &active, Signal::SIGKILL);

            let forceful_polls = options.forceful_timeout.as_secs().max(1);
            for _ in 0..forceful_polls {
                (active, zombies) = partition_tree(&tree);
                if active.is_empty() && zombies.is_empty() {
                    break;
                }

                if active.is_empty() {
                    // Only zombies left: they cannot be killed again, so let
                    // the operator opt out of waiting for their parent.
                    info!(
                        "{} defunct process(es) awaiting reaping for '{service}' \
                         (press enter to stop waiting)",
                        zombies.len()
                    );
                    if escape.should_stop_waiting() {
                        break;
                    }
                }

                thread::sleep(STOP_POLL_INTERVAL);
            }
        }

        // Bookkeeping is cleared even when processes survive: a stale record
        // pointing at an unkillable process would wedge every later command.
        self.registry.clear(service)?;

        if !active.is_empty() {
            error!(
                "Service '{service}' still has active process(es) after SIGKILL: {:?}; \
                 manual intervention required",
                active
            );
            return Ok(false);
        }

        if !zombies.is_empty() {
            info!(
                "Stopped '{service}'; {} defunct process(es) remain until their parent reaps them",
                zombies.len()
            );
        } else {
            info!("Stopped service '{service}'");
        }
        Ok(true)
    }

    /// Restarts a service: unconditional stop, then start. A failed stop just
    /// means start may find the service still running. The restart counter
    /// moves only when the start succeeds.
    pub fn restart_service(&self, service: &str) -> Result<bool, SupervisorError> {
        if let Err(err) = self.stop_service(service) {
            warn!("Stop during restart of '{service}' failed: {err}");
        }

        let started = self.start_service(service, false)?;
        if started {
            let count = self.registry.bump_restarts(service)?;
            debug!("Service '{service}' restart count is now {count}");
        }
        Ok(started)
    }

    /// Snapshot of a running service's process tree with per-process and
    /// aggregate usage. `None` when the service is not running.
    pub fn get_process_tree_info(&self, service: &str) -> Option<ProcessTreeInfo> {
        let pid = self.get_service_pid(service)?;
        let tree = process_tree(pid);

        let collector = StatsCollector::new();
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let describe = |pid: u32| -> ProcessInfo {
            let process = system.process(sysinfo::Pid::from_u32(pid));
            ProcessInfo {
                pid,
                command: process
                    .map(|p| {
                        let cmd: Vec<String> = p
                            .cmd()
                            .iter()
                            .map(|part| part.to_string_lossy().to_string())
                            .collect();
                        if cmd.is_empty() {
                            p.name().to_string_lossy().to_string()
                        } else {
                            cmd.join(" ")
                        }
                    })
                    .unwrap_or_else(|| "<exited>".to_string()),
                cpu_percent: process.map(|p| p.cpu_usage()).unwrap_or(0.0),
                memory_mb: process
                    .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
                    .unwrap_or(0.0),
            }
        };

        let main = describe(pid);
        let children = tree[1..].iter().map(|&child| describe(child)).collect();
        let totals = collector.tree_stats(&tree);

        Some(ProcessTreeInfo {
            main,
            children,
            totals,
        })
    }
}

/// Sends a signal to the leader's process group and to each tree member
/// individually. ESRCH is expected for racing exits and ignored; other
/// failures are logged and skipped so one stubborn PID never stalls the rest.
fn signal_tree(leader: u32, tree: &[u32], sig: Signal) {
    let leader_pid = Pid::from_raw(leader as i32);

    match getpgid(Some(leader_pid)) {
        Ok(pgid) => {
            if let Err(err) = signal::killpg(pgid, sig)
                && err != Errno::ESRCH
            {
                warn!("Failed to signal process group {pgid} with {sig}: {err}");
            }
        }
        Err(err) if err != Errno::ESRCH => {
            warn!("Failed to resolve process group for PID {leader}: {err}");
        }
        Err(_) => {}
    }

    for &member in tree {
        if let Err(err) = signal::kill(Pid::from_raw(member as i32), sig)
            && err != Errno::ESRCH
        {
            warn!("Failed to signal PID {member} with {sig}: {err}");
        }
    }
}
