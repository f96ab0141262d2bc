//! Remote execution over HTTP.
//!
//! The remote endpoint accepts invocations and is polled until they settle:
//!
//! - `POST {endpoint}/invocations` submits a payload
//! - `GET {endpoint}/invocations/{id}` reports its state
//! - `DELETE {endpoint}/invocations/{id}` abandons it

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::core::Task;
use crate::orchestration::backend::{
    BackendHint, ExecutionBackend, ExecutionFailure, ExecutionOutcome, FailureCategory,
};
use crate::orchestration::isolation::IsolationContext;
use crate::util::truncate;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the invocation endpoint.
    pub endpoint: String,
    /// Sent as a bearer token when set.
    pub api_token: Option<String>,
    pub poll_interval_ms: u64,
    /// Timeout for each individual HTTP request.
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_token: None,
            poll_interval_ms: 500,
            request_timeout_secs: 30,
        }
    }
}

impl RemoteConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum InvocationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct InvocationState {
    id: String,
    status: InvocationStatus,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    exit_code: Option<i32>,
    #[serde(default)]
    error: Option<RemoteError>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: RemoteError,
}

enum Interrupt {
    Deadline,
    Cancelled,
}

/// Executes payloads on a remote compute endpoint.
pub struct RemoteBackend {
    config: RemoteConfig,
    client: reqwest::Client,
}

impl RemoteBackend {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn submit(
        &self,
        task: &Task,
        ctx: &IsolationContext,
        timeout: Duration,
    ) -> std::result::Result<InvocationState, ExecutionFailure> {
        let body = json!({
            "task_id": task.id,
            "run_id": ctx.run_id,
            "branch": ctx.branch,
            "payload": task.payload,
            "timeout_secs": timeout.as_secs().max(1),
        });
        tracing::trace!(task = %task.id, %body, "submitting remote invocation");
        let request = self
            .authorize(self.client.post(self.url("/invocations")))
            .json(&body);
        self.send(request).await
    }

    async fn poll(&self, id: &str) -> std::result::Result<InvocationState, ExecutionFailure> {
        let request = self.authorize(self.client.get(self.url(&format!("/invocations/{}", id))));
        self.send(request).await
    }

    /// Best effort; the invocation is abandoned either way.
    async fn abandon(&self, id: &str) {
        let request =
            self.authorize(self.client.delete(self.url(&format!("/invocations/{}", id))));
        if let Err(e) = request.send().await {
            tracing::warn!(invocation = id, error = %e, "failed to abandon remote invocation");
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> std::result::Result<InvocationState, ExecutionFailure> {
        let response = request.send().await.map_err(transport_failure)?;
        let status = response.status();
        let text = response.text().await.map_err(transport_failure)?;
        tracing::trace!(%status, body = %truncate(&text, 200), "remote response");
        if !status.is_success() {
            return Err(classify_http(status, &text));
        }
        serde_json::from_str(&text).map_err(|e| {
            ExecutionFailure::new(
                FailureCategory::Remote,
                format!("malformed response: {}", e),
            )
        })
    }

    async fn interruptible<F: Future>(
        fut: F,
        deadline: tokio::time::Instant,
        cancel: &CancellationToken,
    ) -> std::result::Result<F::Output, Interrupt> {
        tokio::select! {
            out = fut => Ok(out),
            _ = tokio::time::sleep_until(deadline) => Err(Interrupt::Deadline),
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        }
    }
}

fn transport_failure(e: reqwest::Error) -> ExecutionFailure {
    ExecutionFailure::new(FailureCategory::Transport, e.to_string())
}

/// Map an HTTP error response onto the shared failure categories.
fn classify_http(status: StatusCode, body: &str) -> ExecutionFailure {
    let remote = serde_json::from_str::<ErrorBody>(body).ok().map(|b| b.error);
    if let Some(err) = &remote {
        if let Some(category) = classify_code(&err.code) {
            return ExecutionFailure::new(category, err.message.clone());
        }
    }
    let category = match status {
        StatusCode::TOO_MANY_REQUESTS => FailureCategory::QuotaExceeded,
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => FailureCategory::ColdStart,
        _ => FailureCategory::Remote,
    };
    let detail = match remote {
        Some(err) if !err.message.is_empty() => err.message,
        _ => truncate(body.trim(), 200),
    };
    ExecutionFailure::new(category, format!("HTTP {}: {}", status.as_u16(), detail))
}

fn classify_code(code: &str) -> Option<FailureCategory> {
    match code {
        "quota_exceeded" | "rate_limited" => Some(FailureCategory::QuotaExceeded),
        "cold_start_timeout" => Some(FailureCategory::ColdStart),
        _ => None,
    }
}

fn output_text(output: Option<Value>) -> String {
    match output {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    }
}

fn settle(state: InvocationState, started: Instant) -> Option<ExecutionOutcome> {
    let remote = BackendHint::Remote;
    match state.status {
        InvocationStatus::Succeeded => Some(
            ExecutionOutcome::succeeded(remote, output_text(state.output), started.elapsed())
                .with_exit_code(state.exit_code.or(Some(0))),
        ),
        InvocationStatus::Failed => {
            // An exit code means the task itself ran and failed.
            let fallback = match state.exit_code {
                Some(_) => FailureCategory::NonZeroExit,
                None => FailureCategory::Remote,
            };
            let failure = match state.error {
                Some(err) => ExecutionFailure::new(
                    classify_code(&err.code).unwrap_or(fallback),
                    if err.message.is_empty() { err.code } else { err.message },
                ),
                None => ExecutionFailure::new(fallback, "remote invocation failed"),
            };
            Some(
                ExecutionOutcome::failed(remote, failure, started.elapsed())
                    .with_output(output_text(state.output))
                    .with_exit_code(state.exit_code),
            )
        }
        InvocationStatus::Pending | InvocationStatus::Running | InvocationStatus::Unknown => None,
    }
}

#[async_trait]
impl ExecutionBackend for RemoteBackend {
    fn kind(&self) -> BackendHint {
        BackendHint::Remote
    }

    async fn execute(
        &self,
        task: &Task,
        ctx: &IsolationContext,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let remote = BackendHint::Remote;
        let interrupted = |why: Interrupt| match why {
            Interrupt::Deadline => ExecutionOutcome::timed_out(remote, timeout, started.elapsed()),
            Interrupt::Cancelled => ExecutionOutcome::cancelled(remote, started.elapsed()),
        };

        let mut state =
            match Self::interruptible(self.submit(task, ctx, timeout), deadline, &cancel).await {
                Ok(Ok(state)) => state,
                Ok(Err(failure)) => {
                    tracing::warn!(task = %task.id, %failure, "remote submission failed");
                    return ExecutionOutcome::failed(remote, failure, started.elapsed());
                }
                Err(why) => return interrupted(why),
            };
        let id = state.id.clone();
        tracing::debug!(task = %task.id, invocation = %id, "remote invocation accepted");

        loop {
            if let Some(outcome) = settle(state, started) {
                return outcome;
            }
            let next = Self::interruptible(
                async {
                    tokio::time::sleep(self.config.poll_interval()).await;
                    self.poll(&id).await
                },
                deadline,
                &cancel,
            )
            .await;
            state = match next {
                Ok(Ok(state)) => state,
                Ok(Err(failure)) => {
                    return ExecutionOutcome::failed(remote, failure, started.elapsed())
                }
                Err(why) => {
                    self.abandon(&id).await;
                    return interrupted(why);
                }
            };
        }
    }
}
