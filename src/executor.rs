//! Isolated executor with per-task timeouts, cancellation and statistics.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ExecutorConfig, IsolationMode};
use crate::hooks::{HookSet, TaskHook};
use crate::isolation::{IsolationStrategy, ProcessIsolation, ThreadIsolation};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::worker::{FunctionRegistry, WorkerMessage, WorkerRequest};
use crate::{ErrorType, ExecutionStats, ExecutorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorTaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub error_type: ErrorType,
    pub message: String,
}

/// Executor-side wrapper around one callable invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutorTask {
    pub id: String,
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub task_type: String,
    pub max_retries: u32,
    pub retry_count: u32,
    pub timeout: Duration,
    pub metadata: Map<String, Value>,
    pub status: ExecutorTaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<TaskFailure>,
}

impl ExecutorTask {
    pub fn can_retry(&self) -> bool {
        self.status == ExecutorTaskStatus::Failed && self.retry_count < self.max_retries
    }

    pub fn error_type(&self) -> Option<ErrorType> {
        self.error.as_ref().map(|e| e.error_type)
    }

    fn request(&self) -> WorkerRequest {
        WorkerRequest {
            task_id: self.id.clone(),
            function: self.function.clone(),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
        }
    }
}

/// What to run. Unset fields take the executor's configured defaults.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub task_type: String,
    pub task_id: Option<String>,
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
    pub metadata: Map<String, Value>,
}

impl TaskSpec {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            task_type: "custom".to_string(),
            ..Self::default()
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.task_id = Some(id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

struct RunningEntry {
    token: CancellationToken,
    started: Instant,
}

#[derive(Default)]
struct ExecutorState {
    // An id sits in at most one of running/results/errors. Whoever removes it
    // from `running` records the outcome.
    tasks: HashMap<String, ExecutorTask>,
    running: HashMap<String, RunningEntry>,
    results: HashMap<String, Value>,
    errors: HashMap<String, ExecutorError>,
}

impl ExecutorState {
    /// Stores a terminal outcome on the task and in the results/errors maps.
    fn record(&mut self, task_id: &str, outcome: &Result<Value, ExecutorError>) -> Option<ExecutorTask> {
        match outcome {
            Ok(value) => {
                self.results.insert(task_id.to_string(), value.clone());
            }
            Err(err) => {
                self.errors.insert(task_id.to_string(), err.clone());
            }
        }

        let task = self.tasks.get_mut(task_id)?;
        task.completed_at = Some(Utc::now());
        match outcome {
            Ok(value) => {
                task.status = ExecutorTaskStatus::Completed;
                task.result = Some(value.clone());
                task.error = None;
            }
            Err(err) => {
                task.status = ExecutorTaskStatus::Failed;
                task.result = None;
                task.error = Some(TaskFailure {
                    error_type: err.error_type().unwrap_or(ErrorType::ExecutionError),
                    message: err.message(),
                });
            }
        }
        Some(task.clone())
    }
}

enum Outcome {
    Succeeded(Value),
    Failed(String),
    TimedOut(Duration),
    Cancelled,
}

struct Inner {
    state: Mutex<ExecutorState>,
    stats: Mutex<ExecutionStats>,
    hooks: RwLock<HookSet>,
    isolation: Arc<dyn IsolationStrategy>,
    config: ExecutorConfig,
}

#[derive(Clone)]
pub struct IsolatedExecutor {
    inner: Arc<Inner>,
}

impl IsolatedExecutor {
    /// Builds an executor whose isolation follows `config.isolation`. Thread
    /// isolation calls `registry` in-process; process isolation launches
    /// `config.worker_program` (or the current executable), which serves the
    /// same function names through [`crate::serve_if_worker`].
    pub fn new(config: ExecutorConfig, registry: FunctionRegistry) -> std::io::Result<Self> {
        let isolation: Arc<dyn IsolationStrategy> = match config.isolation {
            IsolationMode::Thread => Arc::new(ThreadIsolation::new(Arc::new(registry))),
            IsolationMode::Process => {
                let process = match &config.worker_program {
                    Some(program) => ProcessIsolation::new(program.clone(), config.worker_args.clone()),
                    None => ProcessIsolation::current_exe(config.worker_args.clone())?,
                };
                Arc::new(process)
            }
        };
        Ok(Self::with_isolation(config, isolation))
    }

    pub fn with_isolation(config: ExecutorConfig, isolation: Arc<dyn IsolationStrategy>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ExecutorState::default()),
                stats: Mutex::new(ExecutionStats::default()),
                hooks: RwLock::new(HookSet::new()),
                isolation,
                config,
            }),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    pub async fn register_hook(&self, hook: Arc<dyn TaskHook>) {
        self.inner.hooks.write().await.push(hook);
    }

    async fn hooks(&self) -> HookSet {
        self.inner.hooks.read().await.clone()
    }

    /// Registers a task without running it. Re-using the id of a running
    /// task is refused.
    pub async fn create_task(&self, spec: TaskSpec) -> Result<String, ExecutorError> {
        let id = spec.task_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let config = &self.inner.config;
        let task = ExecutorTask {
            id: id.clone(),
            function: spec.function,
            args: spec.args,
            kwargs: spec.kwargs,
            task_type: spec.task_type,
            max_retries: spec.max_retries.unwrap_or(config.default_max_retries),
            retry_count: 0,
            timeout: spec.timeout.unwrap_or_else(|| config.default_timeout()),
            metadata: spec.metadata,
            status: ExecutorTaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        };

        let mut state = self.inner.state.lock().await;
        if state.running.contains_key(&id) {
            return Err(ExecutorError::AlreadyRunning(id));
        }
        state.results.remove(&id);
        state.errors.remove(&id);
        debug!(event = "task_created", task_id = %id, function = %task.function, task_type = %task.task_type);
        state.tasks.insert(id.clone(), task);
        Ok(id)
    }

    /// Runs one task to completion in its isolated worker.
    pub async fn execute_task(&self, task_id: &str) -> Result<Value, ExecutorError> {
        self.run(task_id, None).await
    }

    /// A task started under `batch` is cancelled along with it, even when
    /// the batch is cancelled before the task registers as running.
    async fn run(&self, task_id: &str, batch: Option<&CancellationToken>) -> Result<Value, ExecutorError> {
        let (snapshot, token) = {
            let mut state = self.inner.state.lock().await;
            if state.running.contains_key(task_id) {
                return Err(ExecutorError::AlreadyRunning(task_id.to_string()));
            }
            let Some(task) = state.tasks.get_mut(task_id) else {
                return Err(ExecutorError::TaskNotFound(task_id.to_string()));
            };
            task.status = ExecutorTaskStatus::Running;
            task.started_at = Some(Utc::now());
            task.completed_at = None;
            task.result = None;
            task.error = None;
            let snapshot = task.clone();

            state.results.remove(task_id);
            state.errors.remove(task_id);
            let token = batch.map_or_else(CancellationToken::new, CancellationToken::child_token);
            state.running.insert(
                task_id.to_string(),
                RunningEntry {
                    token: token.clone(),
                    started: Instant::now(),
                },
            );
            (snapshot, token)
        };

        info!(
            event = "task_started",
            task_id,
            function = %snapshot.function,
            isolation = self.inner.isolation.name(),
            timeout_ms = snapshot.timeout.as_millis() as u64
        );
        self.hooks().await.before_task(&snapshot).await;

        let outcome = match self.inner.isolation.spawn(snapshot.request()).await {
            Err(e) => Outcome::Failed(e),
            Ok(mut worker) => {
                let outcome = tokio::select! {
                    message = worker.wait() => match message {
                        WorkerMessage::Success { result } => Outcome::Succeeded(result),
                        WorkerMessage::Failure { message } => Outcome::Failed(message),
                    },
                    _ = tokio::time::sleep(snapshot.timeout) => Outcome::TimedOut(snapshot.timeout),
                    _ = token.cancelled() => Outcome::Cancelled,
                };
                if matches!(outcome, Outcome::TimedOut(_) | Outcome::Cancelled) {
                    worker.terminate(self.inner.config.terminate_grace()).await;
                }
                outcome
            }
        };

        self.finish(task_id, outcome).await
    }

    async fn finish(&self, task_id: &str, outcome: Outcome) -> Result<Value, ExecutorError> {
        let mut state = self.inner.state.lock().await;
        let Some(entry) = state.running.remove(task_id) else {
            // Cancelled or cleaned up while in flight; that outcome stands.
            debug!(event = "late_outcome_discarded", task_id);
            return Err(state.errors.get(task_id).cloned().unwrap_or_else(|| {
                ExecutorError::TaskCancelled {
                    task_id: task_id.to_string(),
                    message: "task was cancelled".to_string(),
                }
            }));
        };

        let duration = entry.started.elapsed();
        let result = match outcome {
            Outcome::Succeeded(value) => Ok(value),
            Outcome::Failed(message) => Err(ExecutorError::TaskExecution {
                task_id: task_id.to_string(),
                message,
            }),
            Outcome::TimedOut(limit) => Err(ExecutorError::TaskTimeout {
                task_id: task_id.to_string(),
                message: format!("exceeded timeout of {:.3}s", limit.as_secs_f64()),
            }),
            Outcome::Cancelled => Err(ExecutorError::TaskCancelled {
                task_id: task_id.to_string(),
                message: "task was cancelled".to_string(),
            }),
        };
        let snapshot = state.record(task_id, &result);
        drop(state);

        let failure = result.as_ref().err().and_then(ExecutorError::error_type);
        self.inner.stats.lock().await.record(failure, duration);

        let duration_ms = duration.as_millis() as u64;
        match &result {
            Ok(_) => info!(event = "task_completed", task_id, duration_ms),
            Err(err) => error!(
                event = "task_failed",
                task_id,
                duration_ms,
                error_type = failure.map(|f| f.as_str()).unwrap_or("execution_error"),
                "{}",
                err
            ),
        }

        if let Some(snapshot) = snapshot {
            let hooks = self.hooks().await;
            match &result {
                Ok(value) => hooks.after_task(&snapshot, value).await,
                Err(err) => hooks.on_error(&snapshot, err).await,
            }
        }

        result
    }

    /// Runs several tasks on a pool of `max_workers`. `None` runs every
    /// pending task. When `timeout` elapses, collection stops and batch
    /// members still running are cancelled; their entries are absent from
    /// the returned map.
    pub async fn execute_tasks(
        &self,
        task_ids: Option<Vec<String>>,
        timeout: Option<Duration>,
    ) -> HashMap<String, Result<Value, ExecutorError>> {
        let ids = match task_ids {
            Some(ids) => ids,
            None => {
                let state = self.inner.state.lock().await;
                let mut pending: Vec<&ExecutorTask> = state
                    .tasks
                    .values()
                    .filter(|t| t.status == ExecutorTaskStatus::Pending)
                    .collect();
                pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                pending.into_iter().map(|t| t.id.clone()).collect()
            }
        };

        let max_workers = self.inner.config.max_workers();
        info!(event = "batch_started", tasks = ids.len(), max_workers);

        let semaphore = Arc::new(Semaphore::new(max_workers));
        let batch = CancellationToken::new();
        let mut set = JoinSet::new();

        for id in ids.iter().cloned() {
            let executor = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let batch = batch.clone();
            set.spawn(async move {
                let permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit.ok(),
                    _ = batch.cancelled() => None,
                };
                let Some(_permit) = permit else {
                    return (id, None);
                };
                if batch.is_cancelled() {
                    return (id, None);
                }
                let result = executor.run(&id, Some(&batch)).await;
                (id, Some(result))
            });
        }

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut outstanding: HashSet<String> = ids.iter().cloned().collect();
        let mut results = HashMap::new();
        loop {
            let next = match deadline {
                Some(deadline) => {
                    let waited = tokio::time::timeout_at(deadline, set.join_next()).await;
                    match waited {
                        Ok(next) => next,
                        Err(_) => {
                            warn!(event = "batch_deadline", collected = results.len(), "batch deadline reached");
                            batch.cancel();
                            for id in &outstanding {
                                self.cancel_task(id, Some("batch deadline exceeded")).await;
                            }
                            // Cancelled members still clean up after themselves.
                            set.detach_all();
                            break;
                        }
                    }
                }
                None => set.join_next().await,
            };

            match next {
                Some(Ok((id, Some(result)))) => {
                    outstanding.remove(&id);
                    results.insert(id, result);
                }
                Some(Ok((id, None))) => {
                    outstanding.remove(&id);
                }
                Some(Err(e)) => error!(event = "batch_join_failed", "batch member failed to join: {}", e),
                None => break,
            }
        }

        info!(event = "batch_finished", collected = results.len());
        results
    }

    /// Cancels an in-flight task. The worker is stopped by the executing
    /// call; a result that slips in meanwhile is discarded.
    pub async fn cancel_task(&self, task_id: &str, reason: Option<&str>) -> bool {
        let (snapshot, error) = {
            let mut state = self.inner.state.lock().await;
            let Some(entry) = state.running.remove(task_id) else {
                return false;
            };
            entry.token.cancel();

            let error = ExecutorError::TaskCancelled {
                task_id: task_id.to_string(),
                message: reason.unwrap_or("cancelled by caller").to_string(),
            };
            let snapshot = state.record(task_id, &Err(error.clone()));
            drop(state);

            self.inner
                .stats
                .lock()
                .await
                .record(Some(ErrorType::Cancelled), entry.started.elapsed());
            (snapshot, error)
        };

        info!(event = "task_cancelled", task_id, reason = reason.unwrap_or(""));
        if let Some(snapshot) = snapshot {
            self.hooks().await.on_error(&snapshot, &error).await;
        }
        true
    }

    pub async fn cancel_all_tasks(&self, reason: Option<&str>) -> usize {
        let ids: Vec<String> = self.inner.state.lock().await.running.keys().cloned().collect();
        let mut cancelled = 0;
        for id in ids {
            if self.cancel_task(&id, reason).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Waits for a task's outcome, starting the task first if nobody has.
    pub async fn wait_for_task(&self, task_id: &str, timeout: Option<Duration>) -> Result<Value, ExecutorError> {
        let started_at = Instant::now();
        let mut launched = false;

        loop {
            let idle = {
                let state = self.inner.state.lock().await;
                if let Some(value) = state.results.get(task_id) {
                    return Ok(value.clone());
                }
                if let Some(err) = state.errors.get(task_id) {
                    return Err(err.clone());
                }
                let Some(task) = state.tasks.get(task_id) else {
                    return Err(ExecutorError::TaskNotFound(task_id.to_string()));
                };
                task.status == ExecutorTaskStatus::Pending && !state.running.contains_key(task_id)
            };

            if idle && !launched {
                launched = true;
                let executor = self.clone();
                let id = task_id.to_string();
                tokio::spawn(async move {
                    let _ = executor.execute_task(&id).await;
                });
            }

            if let Some(limit) = timeout {
                if started_at.elapsed() >= limit {
                    return Err(ExecutorError::TaskTimeout {
                        task_id: task_id.to_string(),
                        message: format!("no outcome after waiting {:.3}s", limit.as_secs_f64()),
                    });
                }
            }
            tokio::time::sleep(self.inner.config.wait_poll_interval()).await;
        }
    }

    pub async fn get_task_status(&self, task_id: &str) -> Option<ExecutorTask> {
        self.inner.state.lock().await.tasks.get(task_id).cloned()
    }

    /// The recorded outcome, or `None` while the task has not finished.
    pub async fn get_task_result(&self, task_id: &str) -> Option<Result<Value, ExecutorError>> {
        let state = self.inner.state.lock().await;
        if let Some(value) = state.results.get(task_id) {
            return Some(Ok(value.clone()));
        }
        state.errors.get(task_id).cloned().map(Err)
    }

    /// Puts a failed task back to pending when it has retries left.
    pub async fn retry_task(&self, task_id: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.running.contains_key(task_id) {
            return false;
        }
        let Some(task) = state.tasks.get_mut(task_id) else {
            return false;
        };
        if !task.can_retry() {
            return false;
        }
        task.retry_count += 1;
        task.status = ExecutorTaskStatus::Pending;
        task.started_at = None;
        task.completed_at = None;
        task.result = None;
        task.error = None;
        let retry_count = task.retry_count;
        state.errors.remove(task_id);
        state.results.remove(task_id);
        info!(event = "task_retry", task_id, retry_count);
        true
    }

    /// Executes the task, re-submitting it after timeouts and execution
    /// errors until it succeeds or its retries run out. Cancellation ends
    /// the loop immediately. `policy` overrides the configured backoff.
    pub async fn execute_with_retry(
        &self,
        task_id: &str,
        policy: Option<RetryPolicy>,
        ctx: CancellationToken,
    ) -> Result<Value, ExecutorError> {
        let budget = {
            let state = self.inner.state.lock().await;
            let task = state
                .tasks
                .get(task_id)
                .ok_or_else(|| ExecutorError::TaskNotFound(task_id.to_string()))?;
            task.max_retries.saturating_sub(task.retry_count) + 1
        };
        let retry = RetryExecutor::new(Some(policy.unwrap_or_else(|| self.inner.config.retry.clone())));
        let max_attempts = match retry.policy().max_attempts {
            n if n > 0 => budget.min(n as u32),
            _ => budget,
        };

        retry
            .execute_with_retry(
                ctx,
                task_id,
                max_attempts,
                |err| matches!(err.error_type(), Some(ErrorType::Timeout | ErrorType::ExecutionError)),
                |attempt| {
                    let executor = self.clone();
                    let id = task_id.to_string();
                    async move {
                        if attempt > 1 && !executor.retry_task(&id).await {
                            return Err(executor
                                .get_task_result(&id)
                                .await
                                .and_then(Result::err)
                                .unwrap_or(ExecutorError::TaskNotFound(id)));
                        }
                        executor.execute_task(&id).await
                    }
                },
            )
            .await
    }

    pub async fn get_stats(&self) -> ExecutionStats {
        let mut stats = self.inner.stats.lock().await.clone();
        let state = self.inner.state.lock().await;
        stats.running_tasks = state.running.len();
        stats.pending_tasks = state
            .tasks
            .values()
            .filter(|t| t.status == ExecutorTaskStatus::Pending)
            .count();
        stats
    }

    pub async fn reset_stats(&self) {
        *self.inner.stats.lock().await = ExecutionStats::default();
    }

    /// Cancels everything in flight and forgets all tasks.
    pub async fn cleanup(&self) {
        let cancelled = self.cancel_all_tasks(Some("executor cleanup")).await;
        let mut state = self.inner.state.lock().await;
        state.tasks.clear();
        state.running.clear();
        state.results.clear();
        state.errors.clear();
        info!(event = "executor_cleanup", cancelled);
    }
}
