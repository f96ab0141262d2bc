//! Execution backend abstraction.
//!
//! A backend runs one task payload inside an [`IsolationContext`] and
//! reports an [`ExecutionOutcome`]. Local and remote backends produce the
//! same outcome shape, so nothing downstream needs to know where a task ran.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::core::Task;
use crate::orchestration::isolation::IsolationContext;
use crate::util::truncate;
use crate::{Error, Result};

/// Default grace period between SIGTERM and a forced kill.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Where a task should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendHint {
    Local,
    Remote,
}

impl std::fmt::Display for BackendHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendHint::Local => write!(f, "local"),
            BackendHint::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

/// Generic failure categories shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// The process ran and exited unsuccessfully.
    NonZeroExit,
    /// The process could not be started.
    Spawn,
    InvalidPayload,
    Timeout,
    Cancelled,
    QuotaExceeded,
    /// The remote function did not become ready in time.
    ColdStart,
    /// The remote endpoint could not be reached.
    Transport,
    /// Any other error reported by the remote endpoint.
    Remote,
}

impl FailureCategory {
    /// Failures that say the backend, not the task, misbehaved.
    pub fn is_backend_fault(&self) -> bool {
        matches!(
            self,
            FailureCategory::QuotaExceeded
                | FailureCategory::ColdStart
                | FailureCategory::Transport
                | FailureCategory::Remote
                | FailureCategory::Timeout
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub category: FailureCategory,
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.category, self.message)
    }
}

/// What a backend reports after running a task.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub status: OutcomeStatus,
    /// Standard output or the remote result payload.
    pub output: String,
    pub exit_code: Option<i32>,
    pub error: Option<ExecutionFailure>,
    pub backend: BackendHint,
    pub duration: Duration,
}

impl ExecutionOutcome {
    pub fn succeeded(backend: BackendHint, output: String, duration: Duration) -> Self {
        Self {
            status: OutcomeStatus::Succeeded,
            output,
            exit_code: Some(0),
            error: None,
            backend,
            duration,
        }
    }

    pub fn failed(backend: BackendHint, failure: ExecutionFailure, duration: Duration) -> Self {
        let status = match failure.category {
            FailureCategory::Timeout => OutcomeStatus::TimedOut,
            FailureCategory::Cancelled => OutcomeStatus::Cancelled,
            _ => OutcomeStatus::Failed,
        };
        Self {
            status,
            output: String::new(),
            exit_code: None,
            error: Some(failure),
            backend,
            duration,
        }
    }

    pub fn timed_out(backend: BackendHint, timeout: Duration, duration: Duration) -> Self {
        Self::failed(
            backend,
            ExecutionFailure::new(
                FailureCategory::Timeout,
                format!("no result within {:?}", timeout),
            ),
            duration,
        )
    }

    pub fn cancelled(backend: BackendHint, duration: Duration) -> Self {
        Self::failed(
            backend,
            ExecutionFailure::new(FailureCategory::Cancelled, "execution cancelled"),
            duration,
        )
    }

    pub fn with_output(mut self, output: String) -> Self {
        self.output = output;
        self
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Succeeded
    }

    /// Short description of the failure, if any.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.message.clone())
    }
}

/// A substrate able to run task payloads.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendHint;

    /// Run `task` inside `ctx`.
    ///
    /// Implementations must return within `timeout` (plus a bounded
    /// grace period) and must honor `cancel`. Failures are reported in the
    /// outcome, never as a panic or hang.
    async fn execute(
        &self,
        task: &Task,
        ctx: &IsolationContext,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> ExecutionOutcome;
}

/// A local command derived from a task payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<String>,
}

impl Invocation {
    /// Interpret a payload.
    ///
    /// - `"echo hi"` runs through `sh -c`
    /// - `["echo", "hi"]` is an argv
    /// - `{"command": ..., "env": {..}, "stdin": ".."}` adds environment and input
    pub fn from_payload(payload: &Value) -> Result<Self> {
        match payload {
            Value::String(script) => Ok(Self::shell(script)),
            Value::Array(_) => Ok(Self {
                argv: argv_from(payload)?,
                env: BTreeMap::new(),
                stdin: None,
            }),
            Value::Object(map) => {
                let argv = match map.get("command") {
                    Some(Value::String(script)) => Self::shell(script).argv,
                    Some(cmd @ Value::Array(_)) => argv_from(cmd)?,
                    _ => {
                        return Err(Error::InvalidPayload(
                            "object payload needs a string or array `command`".to_string(),
                        ))
                    }
                };
                let mut env = BTreeMap::new();
                if let Some(vars) = map.get("env") {
                    let vars = vars.as_object().ok_or_else(|| {
                        Error::InvalidPayload("`env` must be an object".to_string())
                    })?;
                    for (key, value) in vars {
                        let value = match value {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        env.insert(key.clone(), value);
                    }
                }
                let stdin = match map.get("stdin") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(_) => {
                        return Err(Error::InvalidPayload("`stdin` must be a string".to_string()))
                    }
                };
                Ok(Self { argv, env, stdin })
            }
            Value::Null => Err(Error::InvalidPayload("empty payload".to_string())),
            other => Err(Error::InvalidPayload(format!(
                "unsupported payload: {}",
                truncate(&other.to_string(), 80)
            ))),
        }
    }

    fn shell(script: &str) -> Self {
        Self {
            argv: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
            stdin: None,
        }
    }
}

fn argv_from(value: &Value) -> Result<Vec<String>> {
    let items = value
        .as_array()
        .ok_or_else(|| Error::InvalidPayload("command must be an array".to_string()))?;
    let argv = items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::InvalidPayload("argv entries must be strings".to_string()))
        })
        .collect::<Result<Vec<_>>>()?;
    if argv.is_empty() {
        return Err(Error::InvalidPayload("empty argv".to_string()));
    }
    Ok(argv)
}

/// Runs payloads as child processes on this machine.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    grace: Duration,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new(DEFAULT_CANCEL_GRACE)
    }
}

impl LocalBackend {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    fn build_command(
        &self,
        invocation: &Invocation,
        task: &Task,
        ctx: &IsolationContext,
    ) -> std::io::Result<Command> {
        let tmp = ctx.namespace.join(".tmp");
        std::fs::create_dir_all(&tmp)?;

        let mut cmd = Command::new(&invocation.argv[0]);
        cmd.args(&invocation.argv[1..])
            .current_dir(&ctx.namespace)
            .env("HOME", &ctx.namespace)
            .env("TMPDIR", &tmp)
            .env("DAGRUN_TASK_ID", task.id.as_str())
            .env("DAGRUN_RUN_ID", ctx.run_id.to_string())
            .env("DAGRUN_CONTEXT_ID", ctx.id.to_string())
            .env("DAGRUN_BRANCH", &ctx.branch)
            .env("DAGRUN_NAMESPACE", &ctx.namespace)
            .envs(&invocation.env)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so termination reaches the whole tree.
        #[cfg(unix)]
        cmd.process_group(0);
        Ok(cmd)
    }

    /// SIGTERM the process group, then kill once the grace period ends.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(pid, error = %e, "SIGTERM failed");
            }
        }
        if tokio::time::timeout(self.grace, child.wait()).await.is_ok() {
            return;
        }
        tracing::warn!(grace = ?self.grace, "process ignored SIGTERM, killing");
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
        let _ = child.kill().await;
    }
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Collect a pipe without blocking forever on orphaned writers.
async fn collect(handle: tokio::task::JoinHandle<Vec<u8>>) -> String {
    match tokio::time::timeout(Duration::from_secs(2), handle).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => String::new(),
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> tokio::task::JoinHandle<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    })
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn kind(&self) -> BackendHint {
        BackendHint::Local
    }

    async fn execute(
        &self,
        task: &Task,
        ctx: &IsolationContext,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        let started = Instant::now();
        let local = BackendHint::Local;

        let invocation = match Invocation::from_payload(&task.payload) {
            Ok(inv) => inv,
            Err(e) => {
                return ExecutionOutcome::failed(
                    local,
                    ExecutionFailure::new(FailureCategory::InvalidPayload, e.to_string()),
                    started.elapsed(),
                )
            }
        };

        let mut child = match self
            .build_command(&invocation, task, ctx)
            .and_then(|mut cmd| cmd.spawn())
        {
            Ok(child) => child,
            Err(e) => {
                return ExecutionOutcome::failed(
                    local,
                    ExecutionFailure::new(
                        FailureCategory::Spawn,
                        format!("failed to spawn {}: {}", invocation.argv[0], e),
                    ),
                    started.elapsed(),
                )
            }
        };
        tracing::debug!(task = %task.id, pid = ?child.id(), "spawned local process");

        if let (Some(input), Some(mut stdin)) = (invocation.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                let _ = stdin.write_all(input.as_bytes()).await;
            });
        }
        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(timeout) => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        match waited {
            Waited::Exited(Ok(status)) => {
                let output = collect(stdout).await;
                let errors = collect(stderr).await;
                let duration = started.elapsed();
                if status.success() {
                    ExecutionOutcome::succeeded(local, output, duration)
                } else {
                    let message = match status.code() {
                        Some(code) => format!("exited with code {}", code),
                        None => "terminated by signal".to_string(),
                    };
                    let message = if errors.trim().is_empty() {
                        message
                    } else {
                        format!("{}: {}", message, truncate(errors.trim(), 500))
                    };
                    ExecutionOutcome::failed(
                        local,
                        ExecutionFailure::new(FailureCategory::NonZeroExit, message),
                        duration,
                    )
                    .with_output(output)
                    .with_exit_code(status.code())
                }
            }
            Waited::Exited(Err(e)) => ExecutionOutcome::failed(
                local,
                ExecutionFailure::new(FailureCategory::Spawn, format!("wait failed: {}", e)),
                started.elapsed(),
            ),
            Waited::TimedOut => {
                tracing::warn!(task = %task.id, ?timeout, "local execution timed out");
                self.terminate(&mut child).await;
                let output = collect(stdout).await;
                ExecutionOutcome::timed_out(local, timeout, started.elapsed()).with_output(output)
            }
            Waited::Cancelled => {
                tracing::info!(task = %task.id, "cancelling local execution");
                self.terminate(&mut child).await;
                let output = collect(stdout).await;
                ExecutionOutcome::cancelled(local, started.elapsed()).with_output(output)
            }
        }
    }
}

/// The single `Execute` entry point over the configured backends.
#[derive(Clone)]
pub struct Executor {
    local: Arc<dyn ExecutionBackend>,
    remote: Option<Arc<dyn ExecutionBackend>>,
}

impl Executor {
    pub fn new(local: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            local,
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn ExecutionBackend>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn remote_available(&self) -> bool {
        self.remote.is_some()
    }

    /// Run `task` on the backend named by `hint`.
    ///
    /// A remote hint without a configured remote backend runs locally.
    pub async fn execute(
        &self,
        task: &Task,
        ctx: &IsolationContext,
        hint: BackendHint,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        let backend = match (hint, &self.remote) {
            (BackendHint::Remote, Some(remote)) => remote,
            (BackendHint::Remote, None) => {
                tracing::warn!(task = %task.id, "no remote backend configured, running locally");
                &self.local
            }
            (BackendHint::Local, _) => &self.local,
        };
        backend.execute(task, ctx, timeout, cancel).await
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("remote", &self.remote_available())
            .finish()
    }
}
