use std::time::Duration;

use thiserror::Error;

use crate::models::{CancelReason, ExecutionId, FileId, ProjectId};

/// A sandbox could not be created
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("runtime for {language} unavailable: `{program}` not found on PATH")]
    RuntimeUnavailable { language: String, program: String },
    #[error("no command configured for language {0}")]
    UnknownLanguage(String),
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),
    #[error("invalid file path in project: {0:?}")]
    InvalidPath(String),
    #[error("sandbox I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// The runner could not start the entry process
///
/// Timeouts, crashes and cancellations are not errors of the runner itself;
/// they are reported as a `RunOutcome`.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("sandbox has already been torn down")]
    SandboxGone,
    #[error("entry file {0:?} not found in sandbox")]
    EntryNotFound(String),
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for entry process: {0}")]
    Wait(#[source] std::io::Error),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("project {0} not found")]
    ProjectNotFound(ProjectId),
    #[error("execution {0} not found")]
    ExecutionNotFound(ExecutionId),
    #[error("execution {0} is already terminal")]
    ExecutionTerminal(ExecutionId),
    #[error("file {0} not found")]
    FileNotFound(FileId),
    #[error("environment {0} not found")]
    EnvironmentNotFound(uuid::Uuid),
    #[error("invalid file path: {0:?}")]
    InvalidPath(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Why an execution ended in ERROR
///
/// The `Display` form is what gets appended to the execution's stderr, so each
/// variant names its category first.
#[derive(Error, Debug)]
pub enum ExecutionFailure {
    #[error("provisioning failed: {0}")]
    Provision(#[from] ProvisionError),
    #[error("timeout: exceeded time limit of {:.3}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("crash: process killed by signal {signal} ({name})")]
    Crash { signal: i32, name: &'static str },
    #[error("cancelled: {0}")]
    Cancelled(CancelReason),
    #[error("launch failed: {0}")]
    Launch(#[from] RunnerError),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("interrupted: engine stopped before the execution finished")]
    Interrupted,
}

impl ExecutionFailure {
    /// Line appended to stderr of the failed execution
    pub fn annotation(&self) -> String {
        format!("[rexec] {self}\n")
    }
}

/// Errors surfaced synchronously to callers of the scheduler API
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("unknown project {0}")]
    UnknownProject(ProjectId),
    #[error("unknown execution {0}")]
    UnknownExecution(ExecutionId),
    #[error("invalid entry file {0:?}")]
    InvalidEntry(String),
    #[error("execution {0} is already terminal")]
    AlreadyTerminal(ExecutionId),
    #[error("scheduler is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Storage(StorageError),
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ProjectNotFound(id) => Self::UnknownProject(id),
            StorageError::ExecutionNotFound(id) => Self::UnknownExecution(id),
            StorageError::ExecutionTerminal(id) => Self::AlreadyTerminal(id),
            other => Self::Storage(other),
        }
    }
}
