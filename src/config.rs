use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, RetryPolicy};

/// Top-level configuration, usually read from `isoqueue.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IsoqueueConfig {
    pub queue: QueueConfig,
    pub executor: ExecutorConfig,
    pub logging: LoggingConfig,
}

impl IsoqueueConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str::<IsoqueueConfig>(s)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// JSON snapshot file; `None` keeps the queue in memory only.
    pub queue_file: Option<PathBuf>,
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_file: None,
            poll_interval_ms: 100,
        }
    }
}

impl QueueConfig {
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            queue_file: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    #[default]
    Process,
    Thread,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub isolation: IsolationMode,
    /// Pool size for `execute_tasks`; `None` means `min(32, cpus + 4)`.
    pub max_workers: Option<usize>,
    pub default_timeout_secs: u64,
    pub default_max_retries: u32,
    pub terminate_grace_ms: u64,
    pub wait_poll_interval_ms: u64,
    /// Program spawned for process isolation; defaults to the current executable.
    pub worker_program: Option<PathBuf>,
    pub worker_args: Vec<String>,
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationMode::Process,
            max_workers: None,
            default_timeout_secs: 300,
            default_max_retries: 3,
            terminate_grace_ms: 2_000,
            wait_poll_interval_ms: 100,
            worker_program: None,
            worker_args: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn threaded() -> Self {
        Self {
            isolation: IsolationMode::Thread,
            ..Self::default()
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
            .filter(|n| *n > 0)
            .unwrap_or_else(|| (num_cpus::get() + 4).min(32))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Reported as the `app` field on every json log line.
    pub app: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            app: "isoqueue".to_string(),
        }
    }
}
