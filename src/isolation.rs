use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::worker::{FunctionRegistry, WORKER_FUNCTION_ENV, WorkerMessage, WorkerRequest};

/// Environment variable carrying the task id into a worker process.
pub const WORKER_TASK_ID_ENV: &str = "ISOQUEUE_TASK_ID";

const ABORT_LINE: &str = r#"{"type":"abort"}"#;
const CONTROL_CHANNEL_CAPACITY: usize = 4;

/// A single in-flight execution.
#[async_trait]
pub trait WorkerHandle: Send {
    /// Resolves with the worker's report. Dropping the future before it
    /// resolves must leave the handle usable for `terminate`.
    async fn wait(&mut self) -> WorkerMessage;

    /// Asks the worker to stop, waits up to `grace`, then forces it.
    async fn terminate(&mut self, grace: Duration);

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// How a task is isolated from the caller.
#[async_trait]
pub trait IsolationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn spawn(&self, request: WorkerRequest) -> Result<Box<dyn WorkerHandle>, String>;
}

/// Runs each task on its own OS thread. Threads cannot be killed, so a
/// terminated worker is detached and whatever it reports later is dropped.
pub struct ThreadIsolation {
    registry: Arc<FunctionRegistry>,
}

impl ThreadIsolation {
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self { registry }
    }
}

struct ThreadHandle {
    task_id: String,
    rx: Option<oneshot::Receiver<WorkerMessage>>,
}

#[async_trait]
impl IsolationStrategy for ThreadIsolation {
    fn name(&self) -> &'static str {
        "thread"
    }

    async fn spawn(&self, request: WorkerRequest) -> Result<Box<dyn WorkerHandle>, String> {
        let (tx, rx) = oneshot::channel();
        let registry = Arc::clone(&self.registry);
        let task_id = request.task_id.clone();

        std::thread::Builder::new()
            .name(format!("isoqueue-worker-{}", task_id))
            .spawn(move || {
                let message = registry.call(&request);
                let _ = tx.send(message);
            })
            .map_err(|e| format!("failed to spawn worker thread: {}", e))?;

        Ok(Box::new(ThreadHandle {
            task_id,
            rx: Some(rx),
        }))
    }
}

#[async_trait]
impl WorkerHandle for ThreadHandle {
    async fn wait(&mut self) -> WorkerMessage {
        match self.rx.as_mut() {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| WorkerMessage::failure("worker thread exited without reporting")),
            None => WorkerMessage::failure("worker thread was detached"),
        }
    }

    async fn terminate(&mut self, _grace: Duration) {
        if self.rx.take().is_some() {
            debug!(
                event = "worker_detached",
                task_id = %self.task_id,
                "thread worker cannot be killed; detaching"
            );
        }
    }
}

/// Runs each task in a fresh child process speaking the worker protocol
/// (see [`crate::worker`]).
#[derive(Debug, Clone)]
pub struct ProcessIsolation {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessIsolation {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
        }
    }

    /// Re-launches the running executable as the worker.
    pub fn current_exe(args: Vec<String>) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, args))
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

struct ProcessHandle {
    task_id: String,
    child: Child,
    control: Option<mpsc::Sender<String>>,
    writer: JoinHandle<()>,
    writer_errors: mpsc::Receiver<String>,
    stdout: Lines<BufReader<ChildStdout>>,
    report: Option<WorkerMessage>,
    plain_output: Vec<String>,
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.writer.abort();
    }
}

/// Feeds stdin lines to the child from its own task so a worker that never
/// reads stdin cannot stall the caller.
fn spawn_control_writer(mut stdin: ChildStdin) -> (mpsc::Sender<String>, mpsc::Receiver<String>, JoinHandle<()>) {
    let (ctl_tx, mut ctl_rx) = mpsc::channel::<String>(CONTROL_CHANNEL_CAPACITY);
    let (err_tx, err_rx) = mpsc::channel::<String>(1);

    let task = tokio::spawn(async move {
        while let Some(line) = ctl_rx.recv().await {
            if let Err(e) = write_line(&mut stdin, &line).await {
                let _ = err_tx.try_send(format!("stdin write failed: {}", e));
                break;
            }
        }
    });

    (ctl_tx, err_rx, task)
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

#[async_trait]
impl IsolationStrategy for ProcessIsolation {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn spawn(&self, request: WorkerRequest) -> Result<Box<dyn WorkerHandle>, String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(WORKER_FUNCTION_ENV, &request.function)
            .env(WORKER_TASK_ID_ENV, &request.task_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn worker '{}': {}", self.program.display(), e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "worker stdout was not captured".to_string())?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| "worker stdin was not captured".to_string())?;

        let payload = serde_json::to_string(&request).map_err(|e| format!("failed to encode request: {}", e))?;
        let (control, writer_errors, writer) = spawn_control_writer(stdin);
        control
            .try_send(payload)
            .map_err(|e| format!("failed to queue request: {}", e))?;

        debug!(
            event = "worker_spawned",
            task_id = %request.task_id,
            pid = child.id(),
            program = %self.program.display()
        );

        Ok(Box::new(ProcessHandle {
            task_id: request.task_id,
            child,
            control: Some(control),
            writer,
            writer_errors,
            stdout: BufReader::new(stdout).lines(),
            report: None,
            plain_output: Vec::new(),
        }))
    }
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    async fn wait(&mut self) -> WorkerMessage {
        loop {
            match self.stdout.next_line().await {
                Ok(Some(line)) => match serde_json::from_str::<WorkerMessage>(line.trim()) {
                    Ok(message) => self.report = Some(message),
                    Err(_) => self.plain_output.push(line),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(event = "worker_read_failed", task_id = %self.task_id, "failed reading worker output: {}", e);
                    break;
                }
            }
        }

        let status = self.child.wait().await;
        if let Ok(reason) = self.writer_errors.try_recv() {
            // The program may not read stdin at all; its exit status still counts.
            debug!(event = "worker_request_unsent", task_id = %self.task_id, "{}", reason);
        }
        if let Some(message) = self.report.take() {
            return message;
        }
        match status {
            Ok(status) if status.success() => WorkerMessage::Success {
                result: Value::String(self.plain_output.join("\n").trim().to_string()),
            },
            Ok(status) => WorkerMessage::failure(format!(
                "worker exited with code {} without reporting a result",
                normalize_exit(status)
            )),
            Err(e) => WorkerMessage::failure(format!("failed to wait for worker: {}", e)),
        }
    }

    async fn terminate(&mut self, grace: Duration) {
        // Never blocks: a full channel means the child is not reading stdin.
        if let Some(control) = self.control.take() {
            let _ = control.try_send(ABORT_LINE.to_string());
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => debug!(event = "worker_terminated", task_id = %self.task_id, "worker exited after abort"),
            Err(_) => {
                warn!(
                    event = "worker_killed",
                    task_id = %self.task_id,
                    grace_ms = grace.as_millis() as u64,
                    "worker ignored abort; killing"
                );
                let _ = self.child.kill().await;
            }
        }
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

fn normalize_exit(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(code) = status.code() {
            code
        } else if let Some(sig) = status.signal() {
            128 + sig
        } else {
            1
        }
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};

    fn request(function: &str) -> WorkerRequest {
        WorkerRequest {
            task_id: "iso-1".into(),
            function: function.into(),
            args: vec![json!(20)],
            kwargs: Map::new(),
        }
    }

    #[tokio::test]
    async fn thread_worker_reports_result() {
        let registry = FunctionRegistry::new().register("inc", |a| Ok(json!(a.arg_i64(0)? + 1)));
        let isolation = ThreadIsolation::new(Arc::new(registry));
        let mut handle = isolation.spawn(request("inc")).await.unwrap();
        assert_eq!(handle.wait().await, WorkerMessage::Success { result: json!(21) });
    }

    #[tokio::test]
    async fn detached_thread_worker_reports_failure() {
        let registry = FunctionRegistry::new().register("slow", |_| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(Value::Null)
        });
        let isolation = ThreadIsolation::new(Arc::new(registry));
        let mut handle = isolation.spawn(request("slow")).await.unwrap();
        handle.terminate(Duration::from_millis(10)).await;
        assert!(matches!(handle.wait().await, WorkerMessage::Failure { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_worker_reads_protocol_line() {
        let isolation = ProcessIsolation::new(
            "sh",
            vec![
                "-c".into(),
                r#"read req; echo "noise"; echo '{"status":"success","result":{"fn":"'"$ISOQUEUE_WORKER_FUNCTION"'"}}'"#.into(),
            ],
        );
        let mut handle = isolation.spawn(request("anything")).await.unwrap();
        assert!(handle.pid().is_some());
        assert_eq!(
            handle.wait().await,
            WorkerMessage::Success { result: json!({"fn": "anything"}) }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_without_protocol_uses_exit_status() {
        let ok = ProcessIsolation::new("sh", vec!["-c".into(), "echo plain output".into()]);
        let mut handle = ok.spawn(request("x")).await.unwrap();
        assert_eq!(
            handle.wait().await,
            WorkerMessage::Success { result: json!("plain output") }
        );

        let bad = ProcessIsolation::new("sh", vec!["-c".into(), "exit 3".into()]);
        let mut handle = bad.spawn(request("x")).await.unwrap();
        assert!(matches!(
            handle.wait().await,
            WorkerMessage::Failure { message } if message.contains("code 3")
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_terminate_kills_stubborn_worker() {
        let isolation = ProcessIsolation::new("sh", vec!["-c".into(), "exec sleep 30".into()]);
        let mut handle = isolation.spawn(request("x")).await.unwrap();
        let started = std::time::Instant::now();
        handle.terminate(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn oversized_request_does_not_block_spawn_or_terminate() {
        let isolation = ProcessIsolation::new("sh", vec!["-c".into(), "exec sleep 30".into()]);
        let mut req = request("x");
        req.args = vec![json!("x".repeat(512 * 1024))];

        let started = std::time::Instant::now();
        let mut handle = tokio::time::timeout(Duration::from_secs(2), isolation.spawn(req))
            .await
            .expect("spawn must not wait for the child to read stdin")
            .unwrap();
        handle.terminate(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let isolation = ProcessIsolation::new("/definitely/not/a/real/worker", Vec::new());
        assert!(isolation.spawn(request("x")).await.is_err());
    }
}
