//! Pmon is a lightweight process supervisor used to run, monitor, and manage
//! background services on Unix-like operating systems. Services are declared in
//! a YAML file and launched as detached processes; every CLI invocation
//! re-derives their state from an on-disk registry, so no resident daemon is
//! required.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Service lifecycle and process registry.
pub mod daemon;

/// Environment variable substitution.
pub mod envsub;

/// Error handling.
pub mod error;

/// Logs management.
pub mod logs;

/// On-disk runtime layout.
pub mod runtime;

/// CPU/memory/GPU sampling.
pub mod stats;
