pub mod task;
pub mod validator;
pub mod dependency;
pub mod queue;
pub mod worker;
pub mod isolation;
pub mod hooks;
pub mod stats;
pub mod retry;
pub mod executor;
pub mod config;
pub mod logging;

pub use task::{QueuedTask, TaskPriority, TaskStatus, TaskType};
pub use validator::validate_task;
pub use dependency::{get_dependencies_closure, has_cycle};
pub use queue::{PriorityTaskQueue, StatusCounts};
pub use worker::{FunctionRegistry, TaskArgs, WorkerMessage, WorkerRequest, serve_if_worker};
pub use isolation::{IsolationStrategy, ProcessIsolation, ThreadIsolation, WorkerHandle};
pub use hooks::{HookSet, TaskHook};
pub use stats::ExecutionStats;
pub use retry::{RetryExecutor, RetryPolicy};
pub use executor::{ExecutorTask, ExecutorTaskStatus, IsolatedExecutor, TaskFailure, TaskSpec};
pub use config::{ExecutorConfig, IsolationMode, IsoqueueConfig, LoggingConfig, QueueConfig};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A payload rejected by the validator. `path` names the offending field
/// (dotted for nested metadata keys).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Validation failed at '{path}': {message}")]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Task already queued: {0}")]
    DuplicateTask(String),
    #[error("Queue file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Queue file serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Discriminator carried by every failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Timeout,
    Cancelled,
    ExecutionError,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Timeout => "timeout",
            ErrorType::Cancelled => "cancelled",
            ErrorType::ExecutionError => "execution_error",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("Task {task_id} timed out: {message}")]
    TaskTimeout { task_id: String, message: String },
    #[error("Task {task_id} cancelled: {message}")]
    TaskCancelled { task_id: String, message: String },
    #[error("Task {task_id} failed: {message}")]
    TaskExecution { task_id: String, message: String },
    #[error("Task not found: {0}")]
    TaskNotFound(String),
    #[error("Task is already running: {0}")]
    AlreadyRunning(String),
}

impl ExecutorError {
    pub fn task_id(&self) -> &str {
        match self {
            Self::TaskTimeout { task_id, .. }
            | Self::TaskCancelled { task_id, .. }
            | Self::TaskExecution { task_id, .. } => task_id,
            Self::TaskNotFound(id) | Self::AlreadyRunning(id) => id,
        }
    }

    /// `None` for caller misuse (unknown or already running task).
    pub fn error_type(&self) -> Option<ErrorType> {
        match self {
            Self::TaskTimeout { .. } => Some(ErrorType::Timeout),
            Self::TaskCancelled { .. } => Some(ErrorType::Cancelled),
            Self::TaskExecution { .. } => Some(ErrorType::ExecutionError),
            Self::TaskNotFound(_) | Self::AlreadyRunning(_) => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::TaskTimeout { message, .. }
            | Self::TaskCancelled { message, .. }
            | Self::TaskExecution { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Hook '{hook}' failed: {message}")]
pub struct HookError {
    pub hook: String,
    pub message: String,
}
