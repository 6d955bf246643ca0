//! Priority task queue with dependency gating and JSON persistence.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::dependency::{get_dependencies_closure, has_cycle};
use crate::validator::next_task_id;
use crate::{QueueError, QueuedTask, TaskPriority, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: u8,
    enqueued_at: DateTime<Utc>,
    seq: u64,
    id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub blocked: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<String, QueuedTask>,
    // Blocked tasks keep their key; `get` skips non-pending entries.
    order: BTreeSet<QueueKey>,
    keys: HashMap<String, QueueKey>,
    pending: HashSet<String>,
    blocked: HashSet<String>,
    running: HashSet<String>,
    completed: HashSet<String>,
    failed: HashSet<String>,
    next_seq: u64,
}

impl QueueState {
    fn from_tasks(tasks: Vec<QueuedTask>) -> Self {
        let mut state = Self::default();
        for task in tasks {
            let id = task.id.clone();
            let status = task.status;
            let priority = task.priority;
            let arrival = task.enqueued_at.or(task.created_at).unwrap_or_else(Utc::now);
            state.tasks.insert(id.clone(), task);
            if let Some(set) = state.set_for(status) {
                set.insert(id.clone());
            }
            if matches!(status, TaskStatus::Pending | TaskStatus::Blocked) {
                state.push_key(&id, priority, arrival);
            }
        }
        state
    }

    fn set_for(&mut self, status: TaskStatus) -> Option<&mut HashSet<String>> {
        match status {
            TaskStatus::Pending => Some(&mut self.pending),
            TaskStatus::Blocked => Some(&mut self.blocked),
            TaskStatus::Running => Some(&mut self.running),
            TaskStatus::Completed => Some(&mut self.completed),
            TaskStatus::Failed => Some(&mut self.failed),
            TaskStatus::Cancelled => None,
        }
    }

    fn push_key(&mut self, id: &str, priority: TaskPriority, enqueued_at: DateTime<Utc>) {
        self.remove_key(id);
        let key = QueueKey {
            priority: priority.value(),
            enqueued_at,
            seq: self.next_seq,
            id: id.to_string(),
        };
        self.next_seq += 1;
        self.order.insert(key.clone());
        self.keys.insert(id.to_string(), key);
    }

    fn remove_key(&mut self, id: &str) {
        if let Some(key) = self.keys.remove(id) {
            self.order.remove(&key);
        }
    }

    /// Moves `id` into exactly one status set (none for cancelled) and keeps
    /// the record's `status` field in step.
    fn move_to(&mut self, id: &str, status: TaskStatus) {
        for set in [
            &mut self.pending,
            &mut self.blocked,
            &mut self.running,
            &mut self.completed,
            &mut self.failed,
        ] {
            set.remove(id);
        }
        if let Some(set) = self.set_for(status) {
            set.insert(id.to_string());
        }
        if let Some(task) = self.tasks.get_mut(id) {
            task.status = status;
            task.updated_at = Some(Utc::now());
        }
    }

    fn deps_satisfied(&self, deps: &[String]) -> bool {
        deps.iter().all(|dep| self.completed.contains(dep))
    }

    /// Pending or blocked depending on the task's dependencies, with a fresh
    /// arrival key.
    fn admit(&mut self, id: &str, now: DateTime<Utc>) -> Option<TaskStatus> {
        let task = self.tasks.get(id)?;
        let status = if self.deps_satisfied(&task.dependencies) {
            TaskStatus::Pending
        } else {
            TaskStatus::Blocked
        };
        let priority = task.priority;
        if let Some(task) = self.tasks.get_mut(id) {
            task.enqueued_at = Some(now);
        }
        self.move_to(id, status);
        self.push_key(id, priority, now);
        Some(status)
    }

    fn first_pending(&self) -> Option<&QueueKey> {
        self.order.iter().find(|key| self.pending.contains(&key.id))
    }

    fn take_next(&mut self) -> Option<QueuedTask> {
        let id = self.first_pending()?.id.clone();
        self.remove_key(&id);
        self.move_to(&id, TaskStatus::Running);
        self.tasks.get(&id).cloned()
    }

    /// Unblocks every blocked task that depends on `completed_id` and now has
    /// all of its dependencies completed.
    fn release_dependents(&mut self, completed_id: &str) -> Vec<String> {
        let candidates: Vec<String> = self
            .blocked
            .iter()
            .filter(|id| {
                self.tasks
                    .get(*id)
                    .is_some_and(|t| t.dependencies.iter().any(|d| d == completed_id))
            })
            .cloned()
            .collect();

        let mut released = Vec::new();
        for id in candidates {
            let ready = self
                .tasks
                .get(&id)
                .is_some_and(|t| self.deps_satisfied(&t.dependencies));
            if ready {
                self.move_to(&id, TaskStatus::Pending);
                released.push(id);
            }
        }
        released
    }

    fn counts(&self) -> StatusCounts {
        let total = self.tasks.len();
        let tracked = self.pending.len()
            + self.blocked.len()
            + self.running.len()
            + self.completed.len()
            + self.failed.len();
        StatusCounts {
            pending: self.pending.len(),
            blocked: self.blocked.len(),
            running: self.running.len(),
            completed: self.completed.len(),
            failed: self.failed.len(),
            cancelled: total.saturating_sub(tracked),
            total,
        }
    }

    fn sorted_tasks(&self) -> Vec<QueuedTask> {
        let mut tasks: Vec<QueuedTask> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| {
            a.priority
                .value()
                .cmp(&b.priority.value())
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        tasks
    }
}

pub struct PriorityTaskQueue {
    state: Mutex<QueueState>,
    path: Option<PathBuf>,
    poll_interval: Duration,
}

impl PriorityTaskQueue {
    /// Opens the queue, restoring any snapshot found at the configured file.
    pub async fn open(config: QueueConfig) -> Result<Self, QueueError> {
        let queue = Self {
            state: Mutex::new(QueueState::default()),
            path: config.queue_file.clone(),
            poll_interval: config.poll_interval(),
        };
        if queue.path.is_some() {
            queue.load_queue().await?;
        }
        Ok(queue)
    }

    pub fn in_memory() -> Self {
        let config = QueueConfig::default();
        Self {
            state: Mutex::new(QueueState::default()),
            path: None,
            poll_interval: config.poll_interval(),
        }
    }

    pub fn queue_file(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Admits a task and returns its id (generated when empty).
    pub async fn put(&self, mut task: QueuedTask) -> Result<String, QueueError> {
        let mut state = self.state.lock().await;

        if task.id.is_empty() {
            task.id = next_task_id();
        }
        if state.tasks.contains_key(&task.id) {
            return Err(QueueError::DuplicateTask(task.id));
        }

        let mut seen = HashSet::new();
        task.dependencies.retain(|dep| seen.insert(dep.clone()));

        let now = Utc::now();
        task.created_at.get_or_insert(now);
        task.completed_at = None;
        task.cancelled_at = None;
        task.result = None;
        task.error = None;

        let id = task.id.clone();
        let priority = task.priority;
        state.tasks.insert(id.clone(), task);
        let status = state.admit(&id, now).unwrap_or(TaskStatus::Pending);

        info!(
            event = "task_queued",
            task_id = %id,
            priority = priority.as_str(),
            status = status.as_str(),
            "task queued"
        );
        self.persist(&state).await;
        Ok(id)
    }

    /// Hands out the highest-priority pending task and marks it running.
    /// With `block`, polls until one appears or `timeout` (forever if `None`)
    /// runs out.
    pub async fn get(&self, block: bool, timeout: Option<Duration>) -> Option<QueuedTask> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(task) = state.take_next() {
                    info!(event = "task_dequeued", task_id = %task.id, priority = task.priority.as_str());
                    self.persist(&state).await;
                    return Some(task);
                }
            }

            if !block {
                return None;
            }
            let nap = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.poll_interval.min(deadline - now)
                }
                None => self.poll_interval,
            };
            sleep(nap).await;
        }
    }

    /// Next task `get` would return, left in place.
    pub async fn peek(&self) -> Option<QueuedTask> {
        let state = self.state.lock().await;
        let key = state.first_pending()?;
        state.tasks.get(&key.id).cloned()
    }

    pub async fn task_completed(&self, task_id: &str, success: bool) -> bool {
        self.complete(task_id, success, None, None).await
    }

    /// Like `task_completed`, also storing the task's result or error.
    pub async fn finish_task(&self, task_id: &str, outcome: Result<Value, String>) -> bool {
        match outcome {
            Ok(result) => self.complete(task_id, true, Some(result), None).await,
            Err(error) => self.complete(task_id, false, None, Some(error)).await,
        }
    }

    async fn complete(
        &self,
        task_id: &str,
        success: bool,
        result: Option<Value>,
        error: Option<String>,
    ) -> bool {
        let mut state = self.state.lock().await;

        match state.tasks.get(task_id) {
            None => {
                warn!(event = "task_complete_unknown", task_id, "completion for unknown task");
                return false;
            }
            Some(task) if task.status == TaskStatus::Cancelled => return false,
            Some(_) => {}
        }

        state.remove_key(task_id);
        let status = if success { TaskStatus::Completed } else { TaskStatus::Failed };
        state.move_to(task_id, status);
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.completed_at = Some(Utc::now());
            task.result = result;
            task.error = error;
        }

        let released = if success {
            state.release_dependents(task_id)
        } else {
            Vec::new()
        };

        info!(
            event = "task_finished",
            task_id,
            status = status.as_str(),
            unblocked = released.len(),
            "task finished"
        );
        for id in &released {
            debug!(event = "task_unblocked", task_id = %id, dependency = task_id);
        }

        self.persist(&state).await;
        true
    }

    /// Cancels a task that has not started. Running and finished tasks are
    /// left alone.
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let cancellable = state
            .tasks
            .get(task_id)
            .is_some_and(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Blocked));
        if !cancellable {
            return false;
        }

        state.remove_key(task_id);
        state.move_to(task_id, TaskStatus::Cancelled);
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.cancelled_at = Some(Utc::now());
        }

        info!(event = "task_cancelled", task_id);
        self.persist(&state).await;
        true
    }

    /// Changes priority of a waiting task. The task goes to the back of its
    /// new priority tier.
    pub async fn update_priority(&self, task_id: &str, priority: TaskPriority) -> bool {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(task_id) else {
            return false;
        };
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Blocked) {
            return false;
        }

        let now = Utc::now();
        task.priority = priority;
        task.enqueued_at = Some(now);
        task.updated_at = Some(now);
        state.push_key(task_id, priority, now);

        info!(event = "task_priority_updated", task_id, priority = priority.as_str());
        self.persist(&state).await;
        true
    }

    /// Puts a failed task back in line if it still has retries left.
    pub async fn reset_task(&self, task_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(task_id) else {
            return false;
        };
        if !task.can_retry() {
            return false;
        }

        task.retry_count += 1;
        task.error = None;
        task.result = None;
        task.completed_at = None;
        let retry_count = task.retry_count;

        let status = state.admit(task_id, Utc::now()).unwrap_or(TaskStatus::Pending);
        info!(
            event = "task_reset",
            task_id,
            retry_count,
            status = status.as_str(),
            "task reset for retry"
        );
        self.persist(&state).await;
        true
    }

    pub async fn get_task(&self, task_id: &str) -> Option<QueuedTask> {
        self.state.lock().await.tasks.get(task_id).cloned()
    }

    pub async fn get_status_counts(&self) -> StatusCounts {
        self.state.lock().await.counts()
    }

    /// All tasks, ordered by priority then creation time.
    pub async fn get_all_tasks(&self) -> Vec<QueuedTask> {
        self.state.lock().await.sorted_tasks()
    }

    /// Drops completed tasks (and failed ones too if asked). Returns how many
    /// were removed.
    pub async fn clear_completed(&self, clear_failed: bool) -> usize {
        let mut state = self.state.lock().await;
        let mut doomed: Vec<String> = state.completed.drain().collect();
        if clear_failed {
            doomed.extend(state.failed.drain());
        }
        for id in &doomed {
            state.tasks.remove(id);
        }

        if !doomed.is_empty() {
            info!(event = "tasks_cleared", count = doomed.len(), clear_failed);
            self.persist(&state).await;
        }
        doomed.len()
    }

    /// Number of tasks still waiting (pending or blocked).
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.pending.len() + state.blocked.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn dependency_closure(&self, task_id: &str) -> HashSet<String> {
        get_dependencies_closure(&self.state.lock().await.tasks, task_id)
    }

    /// Whether the queued tasks contain a dependency cycle. Tasks in a cycle
    /// stay blocked; this only reports it.
    pub async fn has_dependency_cycle(&self) -> bool {
        has_cycle(&self.state.lock().await.tasks)
    }

    pub async fn save_queue(&self) -> Result<(), QueueError> {
        let state = self.state.lock().await;
        self.write_snapshot(&state).await
    }

    /// Replaces in-memory state with the snapshot on disk. A missing, empty
    /// or unreadable snapshot yields an empty queue. Returns the number of
    /// tasks loaded.
    pub async fn load_queue(&self) -> Result<usize, QueueError> {
        let Some(path) = &self.path else {
            return Ok(0);
        };

        let tasks = match tokio::fs::read_to_string(path).await {
            Ok(data) if data.trim().is_empty() => Vec::new(),
            Ok(data) => match serde_json::from_str::<Vec<QueuedTask>>(&data) {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(event = "queue_load_corrupt", path = %path.display(), "ignoring unreadable queue file: {}", e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let count = tasks.len();
        let mut state = self.state.lock().await;
        *state = QueueState::from_tasks(tasks);
        info!(event = "queue_loaded", path = %path.display(), tasks = count);
        Ok(count)
    }

    async fn write_snapshot(&self, state: &QueueState) -> Result<(), QueueError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let serialized = serde_json::to_string_pretty(&state.sorted_tasks())?;
        tokio::fs::write(path, serialized).await?;
        Ok(())
    }

    /// Best-effort snapshot after a mutation.
    async fn persist(&self, state: &QueueState) {
        if let Err(e) = self.write_snapshot(state).await {
            warn!(event = "queue_save_failed", "failed to persist queue: {}", e);
        }
    }
}
