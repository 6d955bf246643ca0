use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tracing::warn;

use crate::{ExecutorError, ExecutorTask, HookError};

/// Callback invoked around every execution. Discovery and loading of hooks
/// happen elsewhere; the executor only calls them.
#[async_trait]
pub trait TaskHook: Send + Sync {
    fn name(&self) -> &str;

    /// Right before the worker is spawned.
    async fn before_task(&self, _task: &ExecutorTask) -> Result<(), HookError> {
        Ok(())
    }

    async fn after_task(&self, _task: &ExecutorTask, _result: &Value) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_error(&self, _task: &ExecutorTask, _error: &ExecutorError) -> Result<(), HookError> {
        Ok(())
    }
}

impl HookError {
    pub fn new(hook: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            hook: hook.into(),
            message: message.into(),
        }
    }
}

/// Registered hooks. A failing hook is logged and never changes the task's
/// outcome.
#[derive(Clone, Default)]
pub struct HookSet {
    hooks: Vec<Arc<dyn TaskHook>>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hook: Arc<dyn TaskHook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub async fn before_task(&self, task: &ExecutorTask) {
        let results = join_all(self.hooks.iter().map(|h| h.before_task(task))).await;
        log_failures("before_task", &task.id, results);
    }

    pub async fn after_task(&self, task: &ExecutorTask, result: &Value) {
        let results = join_all(self.hooks.iter().map(|h| h.after_task(task, result))).await;
        log_failures("after_task", &task.id, results);
    }

    pub async fn on_error(&self, task: &ExecutorTask, error: &ExecutorError) {
        let results = join_all(self.hooks.iter().map(|h| h.on_error(task, error))).await;
        log_failures("on_error", &task.id, results);
    }
}

fn log_failures(point: &str, task_id: &str, results: Vec<Result<(), HookError>>) {
    for err in results.into_iter().filter_map(Result::err) {
        warn!(event = "hook_failed", hook_point = point, task_id, hook = %err.hook, "{}", err.message);
    }
}
