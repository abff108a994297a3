//! Centralised error type for the loaders, importer and scheduler.

use std::net::AddrParseError;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error in {0}: {1}")]
    Csv(String, #[source] csv::Error),

    #[error("HTTP error fetching {0}: {1}")]
    Fetch(String, #[source] reqwest::Error),

    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid bind address {0}: {1}")]
    Bind(String, #[source] AddrParseError),

    #[error("Invalid URL {0}: {1}")]
    Url(String, #[source] url::ParseError),

    #[error("Invalid workflow {0}: {1}")]
    InvalidWorkflow(String, #[source] WorkflowValidationError),

    #[error("Schema mismatch for table {table}: {reason}")]
    Schema { table: String, reason: String },

    #[error("Duplicate key {key:?} in table {table}")]
    DuplicateKey { table: String, key: Vec<String> },

    #[error("No sources configured for dataset {0}")]
    UnknownDataset(String),

    #[error("Template {template} references unknown parameter {param}")]
    Template { template: String, param: String },

    #[error("Task {task} failed to start: {source}")]
    Spawn {
        task: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Task {task} exited with {status}")]
    Command { task: String, status: ExitStatus },
}

impl IngestError {
    /// Wrap an I/O error with the path that produced it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IngestError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Structural problems found while registering a workflow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowValidationError {
    #[error("workflow name cannot be empty")]
    EmptyWorkflowName,
    #[error("workflow must contain at least one task")]
    NoTasks,
    #[error("task id cannot be empty")]
    EmptyTaskId,
    #[error("task id {0} is declared twice")]
    DuplicateTask(String),
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },
    #[error("task {task} cannot depend on itself")]
    SelfDependency { task: String },
    #[error("dependency cycle through task {task}")]
    Cycle { task: String },
    #[error("task {task} has an empty shell command")]
    EmptyCommand { task: String },
    #[error("task {task} has no remote repository")]
    EmptyRemote { task: String },
    #[error("invalid cron expression {expression:?}: {message}")]
    InvalidCron { expression: String, message: String },
    #[error("interval schedule must be longer than zero")]
    ZeroInterval,
    #[error("workflow {0} is registered twice")]
    DuplicateWorkflow(String),
}
