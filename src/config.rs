//! Configuration management for pmon.
//!
//! Services are declared in a YAML mapping of name → command. Entries come in
//! two forms: a shorthand string holding just the shell command, or a detailed
//! mapping with `cmd`, `cwd`, `env`, `merge_logs` and `extends` keys. The
//! `extends` key inherits fields from another service entry; inheritance is
//! resolved here at load time so the rest of the supervisor only ever sees
//! flattened [`ServiceConfig`] values.
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};
use tracing::warn;

use crate::error::SupervisorError;

/// Reserved service name; collides with the supervisor's own state files.
pub const RESERVED_NAME: &str = "pmon";

/// Default configuration file name.
pub const DEFAULT_CONFIG: &str = "pmon.yml";

/// Validated service table for one CLI invocation.
#[derive(Debug, Default)]
pub struct Config {
    /// Service names in declaration order; the index doubles as the short id
    /// shown by `ls` and accepted wherever a name is expected.
    names: Vec<String>,
    services: HashMap<String, ServiceConfig>,
    /// Directory containing the config file; relative paths resolve against it.
    pub project_dir: PathBuf,
    /// Values loaded from a `.env` file next to the config, if present.
    pub dotenv: HashMap<String, String>,
}

/// Flattened configuration for an individual service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Shell command used to start the service.
    pub cmd: String,
    /// Optional working directory, relative to the project dir.
    pub cwd: Option<String>,
    /// Per-service environment overrides, merged over the inherited env.
    pub env: HashMap<String, String>,
    /// Interleave stdout and stderr into a single log file.
    pub merge_logs: bool,
}

/// Raw on-disk shape of a detailed service entry, before `extends` resolution.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
struct RawService {
    cmd: Option<String>,
    /// Legacy alias for `cmd`.
    script: Option<String>,
    cwd: Option<String>,
    env: Option<HashMap<String, String>>,
    merge_logs: Option<bool>,
    extends: Option<String>,
}

impl RawService {
    fn command(&self) -> Option<&str> {
        self.cmd.as_deref().or(self.script.as_deref())
    }

    /// Lays `self` over `base`, with `self` winning field-by-field. Env maps
    /// merge key-wise, again with `self` winning.
    fn overlay(&self, base: &RawService) -> RawService {
        let env = match (&base.env, &self.env) {
            (Some(parent), Some(child)) => {
                let mut merged = parent.clone();
                merged.extend(child.clone());
                Some(merged)
            }
            (parent, child) => child.clone().or_else(|| parent.clone()),
        };

        RawService {
            cmd: self.cmd.clone().or_else(|| base.cmd.clone()),
            script: self.script.clone().or_else(|| base.script.clone()),
            cwd: self.cwd.clone().or_else(|| base.cwd.clone()),
            env,
            merge_logs: self.merge_logs.or(base.merge_logs),
            extends: None,
        }
    }
}

impl Config {
    /// Service names in declaration order.
    pub fn get_service_names(&self) -> Vec<String> {
        self.names.clone()
    }

    /// Looks up a single service by name.
    pub fn get(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.get(name)
    }

    /// Resolves a service spec that may be a name or a numeric `ls` row id.
    pub fn resolve_name(&self, spec: &str) -> Option<String> {
        if self.services.contains_key(spec) {
            return Some(spec.to_string());
        }
        spec.parse::<usize>()
            .ok()
            .and_then(|id| self.names.get(id).cloned())
    }
}

/// Parses a `.env`-style file into a map, skipping comments and malformed
/// lines. Surrounding double quotes on values are stripped.
fn parse_env_file(path: &Path) -> Result<HashMap<String, String>, SupervisorError> {
    let content = fs::read_to_string(path).map_err(SupervisorError::ConfigReadError)?;
    let mut vars = HashMap::new();

    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim().to_string();
            let mut value = value.trim();
            if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
                value = &value[1..value.len() - 1];
            }
            vars.insert(key, value.to_string());
        } else {
            warn!("Ignoring malformed line in {}: {line}", path.display());
        }
    }

    Ok(vars)
}

/// Walks the `extends` chain for `name` and returns the flattened entry.
///
/// Returns `None` when the chain references an unknown parent or loops back on
/// itself; the caller logs and skips the service rather than aborting the
/// whole load.
fn resolve_extends(
    name: &str,
    raw: &HashMap<String, RawService>,
) -> Option<RawService> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = name.to_string();

    loop {
        if !seen.insert(current.clone()) {
            warn!("Service '{name}' has a cyclic extends chain; skipping");
            return None;
        }

        let entry = match raw.get(&current) {
            Some(entry) => entry,
            None => {
                warn!("Service '{name}' extends unknown service '{current}'; skipping");
                return None;
            }
        };
        chain.push(entry.clone());

        match &entry.extends {
            Some(parent) => current = parent.clone(),
            None => break,
        }
    }

    // Apply from the root ancestor down so nearer entries win.
    let mut resolved = RawService::default();
    for entry in chain.iter().rev() {
        resolved = entry.overlay(&resolved);
    }
    Some(resolved)
}

/// Loads and validates the configuration file.
///
/// Invalid entries (reserved name, missing command, broken `extends`) are
/// logged and skipped rather than failing the load; a missing or syntactically
/// broken file is a hard error.
pub fn load_config(config_path: &Path) -> Result<Config, SupervisorError> {
    let content = fs::read_to_string(config_path).map_err(|e| {
        SupervisorError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let project_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let document: serde_yaml::Mapping = if content.trim().is_empty() {
        serde_yaml::Mapping::new()
    } else {
        serde_yaml::from_str(&content).map_err(SupervisorError::ConfigParseError)?
    };

    let mut names = Vec::new();
    let mut raw = HashMap::new();

    for (key, value) in document {
        let name = match key.as_str() {
            Some(name) => name.to_string(),
            None => {
                warn!("Ignoring non-string service name in config");
                continue;
            }
        };

        if name.eq_ignore_ascii_case(RESERVED_NAME) {
            warn!("'{RESERVED_NAME}' is a reserved name and cannot be used as a service name");
            continue;
        }

        let entry = match value {
            serde_yaml::Value::String(cmd) => RawService {
                cmd: Some(cmd),
                ..RawService::default()
            },
            other => match serde_yaml::from_value::<RawService>(other) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("Invalid configuration for service '{name}', skipping: {err}");
                    continue;
                }
            },
        };

        names.push(name.clone());
        raw.insert(name, entry);
    }

    let mut services = HashMap::new();
    let mut kept_names = Vec::new();

    for name in names {
        let Some(resolved) = resolve_extends(&name, &raw) else {
            continue;
        };

        let Some(cmd) = resolved.command() else {
            warn!("No command specified for service '{name}', skipping");
            continue;
        };

        services.insert(
            name.clone(),
            ServiceConfig {
                cmd: cmd.to_string(),
                cwd: resolved.cwd.clone(),
                env: resolved.env.clone().unwrap_or_default(),
                merge_logs: resolved.merge_logs.unwrap_or(false),
            },
        );
        kept_names.push(name);
    }

    let dotenv_path = project_dir.join(".env");
    let dotenv = if dotenv_path.exists() {
        parse_env_file(&dotenv_path)?
    } else {
        HashMap::new()
    };

    Ok(Config {
        names: kept_names,
        services,
        project_dir,
        dotenv,
    })
}
