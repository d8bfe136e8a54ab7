//! Error handling for pmon.
use thiserror::Error;

/// Defines all possible errors that can occur in the process supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// A service name was requested that the configuration does not define.
    #[error("Service '{0}' not found in configuration")]
    UnknownService(String),

    /// Error reading or writing the per-service registry files.
    #[error("Registry error: {0}")]
    RegistryError(#[from] RegistryError),

    /// Error from the logs manager.
    #[error("Logs error: {0}")]
    LogsError(#[from] LogsManagerError),
}

/// Error type for the on-disk process registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Error reading or writing a registry file.
    #[error("Failed to access registry file: {0}")]
    IoError(#[from] std::io::Error),
}

/// Error type for logs manager operations.
#[derive(Debug, Error)]
pub enum LogsManagerError {
    /// The requested service has no log files on disk.
    #[error("No log files found for service '{0}'")]
    NoLogFiles(String),

    /// Error reading or writing a log file.
    #[error("Log I/O failed for {path}: {source}")]
    LogIoError {
        /// The offending log file path.
        path: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}
