//! Error types for aerobench

use thiserror::Error;

/// One target that did not complete successfully during a phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFailure {
    pub target: String,
    pub message: String,
}

impl std::fmt::Display for TargetFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.target, self.message)
    }
}

/// aerobench error types
#[derive(Error, Debug)]
pub enum AeroBenchError {
    /// Layered configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// YAML (de)serialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Semantic validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Host group missing from the inventory or empty
    #[error("Host group '{0}' is empty or not defined")]
    EmptyGroup(String),

    /// Host group size disagrees with the declared vm_count
    #[error("Host group '{group}' declares vm_count={expected} but inventory lists {actual} hosts")]
    GroupSizeMismatch {
        group: String,
        expected: usize,
        actual: usize,
    },

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registry errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Remote or local command exited unsuccessfully
    #[error("Command `{command}` on {host} failed (exit code: {exit_code:?}): {stderr}")]
    CommandFailed {
        host: String,
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// SSH errors
    #[error("SSH error on {host}: {message}")]
    Ssh { host: String, message: String },

    /// YCSB output could not be interpreted
    #[error("Failed to parse YCSB output: {0}")]
    YcsbParse(String),

    /// An operation kept failing after all retry attempts
    #[error("'{operation}' failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// Work stopped because cancellation was requested
    #[error("Operation cancelled")]
    Cancelled,

    /// One or more targets failed or were cancelled during a benchmark phase
    #[error("Phase '{phase}': {} target(s) failed, {cancelled} cancelled{}", .failures.len(), join_failures(.failures))]
    Phase {
        phase: String,
        /// Targets whose action returned an error
        failures: Vec<TargetFailure>,
        /// Targets stopped by cancellation or a deadline
        cancelled: usize,
    },

    /// Generic error
    #[error("Error: {0}")]
    Other(String),
}

fn join_failures(failures: &[TargetFailure]) -> String {
    if failures.is_empty() {
        return String::new();
    }
    let listed = failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    format!(": {}", listed)
}

/// Result type alias using AeroBenchError
pub type Result<T> = std::result::Result<T, AeroBenchError>;
