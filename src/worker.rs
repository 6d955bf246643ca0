//! Worker side of isolated execution.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Set in the worker's environment to the name of the function to run.
pub const WORKER_FUNCTION_ENV: &str = "ISOQUEUE_WORKER_FUNCTION";

/// Exit code used when a worker is aborted by its parent.
pub const ABORT_EXIT_CODE: i32 = 143;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub task_id: String,
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerMessage {
    Success { result: Value },
    Failure { message: String },
}

impl WorkerMessage {
    pub fn failure(message: impl Into<String>) -> Self {
        WorkerMessage::Failure {
            message: message.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ControlLine {
    #[serde(rename = "type")]
    ty: String,
}

/// Positional and keyword arguments handed to a task function.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn arg(&self, index: usize) -> Result<&Value, String> {
        self.args
            .get(index)
            .ok_or_else(|| format!("missing positional argument {}", index))
    }

    pub fn arg_i64(&self, index: usize) -> Result<i64, String> {
        self.arg(index)?
            .as_i64()
            .ok_or_else(|| format!("argument {} is not an integer", index))
    }

    pub fn arg_f64(&self, index: usize) -> Result<f64, String> {
        self.arg(index)?
            .as_f64()
            .ok_or_else(|| format!("argument {} is not a number", index))
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }
}

pub type TaskFn = Arc<dyn Fn(&TaskArgs) -> Result<Value, String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, TaskFn>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry").field("functions", &names).finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&TaskArgs) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<TaskFn> {
        self.functions.get(name).cloned()
    }

    /// Runs the requested function, turning errors and panics into
    /// failure messages.
    pub fn call(&self, request: &WorkerRequest) -> WorkerMessage {
        let Some(function) = self.get(&request.function) else {
            return WorkerMessage::failure(format!("unknown function '{}'", request.function));
        };
        let args = TaskArgs {
            args: request.args.clone(),
            kwargs: request.kwargs.clone(),
        };
        match catch_unwind(AssertUnwindSafe(|| function(&args))) {
            Ok(Ok(result)) => WorkerMessage::Success { result },
            Ok(Err(message)) => WorkerMessage::Failure { message },
            Err(panic) => WorkerMessage::failure(format!("task panicked: {}", panic_message(&*panic))),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Serves one request if this process was launched as a worker, returning
/// the exit code the caller should exit with. Returns `None` in a normal
/// (non-worker) launch. Call it at the top of `main`.
///
/// One [`WorkerRequest`] line is read from stdin and one [`WorkerMessage`]
/// line written to stdout; a later `{"type":"abort"}` line asks the worker
/// to exit.
pub fn serve_if_worker(registry: &FunctionRegistry) -> Option<i32> {
    std::env::var(WORKER_FUNCTION_ENV).ok()?;

    let stdin = std::io::stdin();
    let mut line = String::new();
    if let Err(e) = stdin.lock().read_line(&mut line) {
        return Some(report(&WorkerMessage::failure(format!("failed to read request: {}", e))));
    }
    let request: WorkerRequest = match serde_json::from_str(line.trim()) {
        Ok(request) => request,
        Err(e) => return Some(report(&WorkerMessage::failure(format!("malformed request: {}", e)))),
    };

    // Further stdin lines are control messages from the parent.
    std::thread::spawn(|| {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if let Ok(control) = serde_json::from_str::<ControlLine>(&line) {
                if control.ty == "abort" {
                    std::process::exit(ABORT_EXIT_CODE);
                }
            }
        }
    });

    Some(report(&registry.call(&request)))
}

fn report(message: &WorkerMessage) -> i32 {
    let code = match message {
        WorkerMessage::Success { .. } => 0,
        WorkerMessage::Failure { .. } => 1,
    };
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let written = serde_json::to_string(message)
        .map_err(std::io::Error::other)
        .and_then(|line| {
            writeln!(out, "{}", line)?;
            out.flush()
        });
    if written.is_err() {
        return 2;
    }
    code
}
