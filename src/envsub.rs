//! Shell-style environment variable substitution for service commands.
//!
//! Supports `$VAR`, `${VAR}`, `${VAR:-default}` and `${VAR-default}` forms.
//! Defaults may themselves contain variable references; expansion runs as an
//! iterative fixed point so nested defaults resolve on later passes. A hard
//! pass cap guards against mutually referential defaults that never converge.
use std::{collections::HashMap, sync::OnceLock};

use regex::{Captures, Regex};

/// Upper bound on expansion passes for pathological self-referential input.
const MAX_PASSES: usize = 16;

fn simple_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\\?)\$([A-Za-z0-9_]+)").expect("valid regex"))
}

fn extended_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\\?)\$\{([A-Za-z0-9_]+)(?:(:?-)([^}]*))?\}").expect("valid regex")
    })
}

/// Expands variable references in `input` against `env`.
///
/// Unset variables without a default expand to the empty string. A reference
/// preceded by a backslash (`\$VAR`) passes through unexpanded, backslash
/// included. Pure string transformation; no process environment access.
pub fn substitute(input: &str, env: &HashMap<String, String>) -> String {
    let mut result = input.to_string();

    for _ in 0..MAX_PASSES {
        let pass = apply_pass(&result, env);
        if pass == result {
            break;
        }
        result = pass;
    }

    result
}

/// One substitution pass: braced forms first, then bare `$VAR` references.
fn apply_pass(input: &str, env: &HashMap<String, String>) -> String {
    let braced = extended_re().replace_all(input, |caps: &Captures| {
        if !caps[1].is_empty() {
            return caps[0].to_string();
        }

        let value = env.get(&caps[2]);
        match caps.get(3).map(|m| m.as_str()) {
            // `${VAR:-default}`: default also covers set-but-empty.
            Some(":-") => match value {
                Some(v) if !v.is_empty() => v.clone(),
                _ => caps[4].to_string(),
            },
            // `${VAR-default}`: default only when the variable is unset.
            Some("-") => value.cloned().unwrap_or_else(|| caps[4].to_string()),
            _ => value.cloned().unwrap_or_default(),
        }
    });

    simple_re()
        .replace_all(&braced, |caps: &Captures| {
            if !caps[1].is_empty() {
                return caps[0].to_string();
            }
            env.get(&caps[2]).cloned().unwrap_or_default()
        })
        .to_string()
}
