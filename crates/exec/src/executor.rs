//! Runs approved commands on the remote target.
//!
//! Submit is retried with bounded exponential backoff while the transport
//! reports a retryable error.  Once a command has been accepted it is never
//! resubmitted unless the transport says it was not delivered; transient poll
//! failures only retry the poll, and a poll that keeps failing ends the
//! execution as a transport error.  The whole execution, backoff sleeps
//! included, is bounded by the caller's timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use syspilot_config::ExecutorConfig;
use syspilot_policy::Verdict;

use crate::session::SessionManager;
use crate::transport::{ExecutionId, PollStatus, RawOutput, TransportError};

/// A command-type tool call, consumed once by the policy engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub request_id: Uuid,
    pub raw_text: String,
    /// Agent turn that produced the command.
    pub requested_by: String,
    pub timestamp: DateTime<Utc>,
}

impl CommandRequest {
    pub fn new(raw_text: impl Into<String>, requested_by: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            raw_text: raw_text.into(),
            requested_by: requested_by.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    TimedOut,
    TransportError,
    Cancelled,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::TransportError => "transport_error",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub request_id: Uuid,
    /// Remote exit status; `-1` unless the outcome is `Completed`.
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration: Duration,
    pub outcome: Outcome,
    /// Number of submit calls made to the transport.
    pub attempts: u32,
    /// Last transport error, if any attempt failed.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::Completed && self.exit_status == 0
    }

    pub fn truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("internal invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_output_bytes: usize,
}

impl From<&ExecutorConfig> for ExecutorSettings {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            default_timeout: Duration::from_secs(config.default_timeout_secs),
            max_timeout: Duration::from_secs(config.max_timeout_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            max_output_bytes: config.max_output_bytes,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from(&ExecutorConfig::default())
    }
}

impl ExecutorSettings {
    /// Backoff before retry number `failures` (1-based), doubling each time.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// The effective timeout for a requested one, clamped to `max_timeout`.
    pub fn timeout_for(&self, requested: Option<Duration>) -> Duration {
        requested
            .filter(|d| !d.is_zero())
            .unwrap_or(self.default_timeout)
            .min(self.max_timeout)
    }
}

enum Guarded<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

enum AttemptEnd {
    Finished(RawOutput),
    /// Nothing ran remotely; a retry may resubmit.
    Failed(TransportError),
    /// Accepted, but the result could not be collected.  Never resubmitted.
    Abandoned(TransportError),
    TimedOut,
    Cancelled,
}

pub struct RemoteExecutor {
    sessions: Arc<SessionManager>,
    settings: ExecutorSettings,
}

impl RemoteExecutor {
    pub fn new(sessions: Arc<SessionManager>, settings: ExecutorSettings) -> Self {
        Self { sessions, settings }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Run `request` on the remote target.
    ///
    /// `verdict` must be the allow verdict issued for this exact command;
    /// anything else is refused with [`ExecError::InvariantViolation`] and the
    /// transport is never touched.
    pub async fn execute(
        &self,
        request: &CommandRequest,
        verdict: &Verdict,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecError> {
        if !verdict.is_allow() {
            error!(
                request = %request.request_id,
                reason = %verdict.reason,
                "denied command reached the executor"
            );
            return Err(ExecError::InvariantViolation(format!(
                "request {} reached the executor with a deny verdict ({})",
                request.request_id, verdict.reason
            )));
        }
        if !verdict.covers(&request.raw_text) {
            error!(request = %request.request_id, "verdict does not cover the submitted command");
            return Err(ExecError::InvariantViolation(format!(
                "request {} carries a verdict issued for a different command",
                request.request_id
            )));
        }

        let command = request.raw_text.trim();
        let started = Instant::now();
        let started_at = Utc::now();
        let deadline = tokio::time::Instant::now() + timeout;

        let mut attempts = 0u32;
        let mut last_error: Option<TransportError> = None;

        let end = loop {
            attempts += 1;
            match self.attempt(command, deadline, cancel).await {
                AttemptEnd::Failed(err) => {
                    let retry = err.is_retryable() && attempts < self.settings.max_attempts;
                    warn!(
                        request = %request.request_id,
                        attempt = attempts,
                        %err,
                        retry,
                        "transport attempt failed"
                    );
                    if matches!(err, TransportError::Unreachable(_)) {
                        self.sessions.invalidate().await;
                    }
                    last_error = Some(err.clone());
                    if !retry {
                        break AttemptEnd::Failed(err);
                    }
                    let delay = self.settings.backoff(attempts);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break AttemptEnd::Cancelled,
                        _ = tokio::time::sleep_until(deadline) => break AttemptEnd::TimedOut,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                AttemptEnd::Abandoned(err) => {
                    warn!(
                        request = %request.request_id,
                        attempt = attempts,
                        %err,
                        "lost track of accepted command"
                    );
                    last_error = Some(err.clone());
                    break AttemptEnd::Abandoned(err);
                }
                other => break other,
            }
        };

        let mut result = ExecutionResult {
            request_id: request.request_id,
            exit_status: -1,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            duration: Duration::ZERO,
            outcome: Outcome::TransportError,
            attempts,
            error: last_error.as_ref().map(ToString::to_string),
            started_at,
            finished_at: started_at,
        };

        match end {
            AttemptEnd::Finished(raw) => {
                let (stdout, stdout_truncated) = capture(&raw.stdout, self.settings.max_output_bytes);
                let (stderr, stderr_truncated) = capture(&raw.stderr, self.settings.max_output_bytes);
                result.exit_status = raw.exit_status;
                result.stdout = stdout;
                result.stderr = stderr;
                result.stdout_truncated = stdout_truncated;
                result.stderr_truncated = stderr_truncated;
                result.outcome = Outcome::Completed;
            }
            AttemptEnd::TimedOut => result.outcome = Outcome::TimedOut,
            AttemptEnd::Cancelled => result.outcome = Outcome::Cancelled,
            AttemptEnd::Failed(_) | AttemptEnd::Abandoned(_) => {
                result.outcome = Outcome::TransportError
            }
        }
        result.duration = started.elapsed();
        result.finished_at = Utc::now();

        info!(
            request = %request.request_id,
            outcome = result.outcome.as_str(),
            exit_status = result.exit_status,
            attempts,
            duration_ms = result.duration.as_millis() as u64,
            "remote execution finished"
        );
        Ok(result)
    }

    async fn attempt(
        &self,
        command: &str,
        deadline: tokio::time::Instant,
        cancel: &CancellationToken,
    ) -> AttemptEnd {
        let execution = match guarded(self.sessions.submit(command), deadline, cancel).await {
            Guarded::Done(Ok(id)) => id,
            Guarded::Done(Err(err)) => return AttemptEnd::Failed(err),
            Guarded::TimedOut => return AttemptEnd::TimedOut,
            Guarded::Cancelled => return AttemptEnd::Cancelled,
        };
        debug!(execution = %execution, "command accepted by transport");

        let mut poll_failures = 0u32;
        loop {
            let wait = match guarded(self.sessions.poll(&execution), deadline, cancel).await {
                Guarded::Done(Ok(PollStatus::Finished(raw))) => return AttemptEnd::Finished(raw),
                Guarded::Done(Ok(PollStatus::Pending)) => {
                    poll_failures = 0;
                    self.settings.poll_interval
                }
                Guarded::Done(Err(err @ TransportError::NotDelivered(_))) => {
                    return AttemptEnd::Failed(err);
                }
                Guarded::Done(Err(err)) => {
                    poll_failures += 1;
                    if matches!(err, TransportError::Unreachable(_)) {
                        self.sessions.invalidate().await;
                    }
                    if !err.is_retryable() || poll_failures >= self.settings.max_attempts {
                        self.cancel_remote(execution);
                        return AttemptEnd::Abandoned(err);
                    }
                    warn!(execution = %execution, %err, poll_failures, "poll failed, retrying");
                    self.settings.backoff(poll_failures)
                }
                Guarded::TimedOut => {
                    self.cancel_remote(execution);
                    return AttemptEnd::TimedOut;
                }
                Guarded::Cancelled => {
                    self.cancel_remote(execution);
                    return AttemptEnd::Cancelled;
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.cancel_remote(execution);
                    return AttemptEnd::Cancelled;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.cancel_remote(execution);
                    return AttemptEnd::TimedOut;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Fire-and-forget remote cancellation.
    fn cancel_remote(&self, execution: ExecutionId) {
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            match sessions.cancel(&execution).await {
                Ok(()) => debug!(execution = %execution, "remote cancellation requested"),
                Err(err) => warn!(execution = %execution, %err, "remote cancellation failed"),
            }
        });
    }
}

async fn guarded<F, T>(fut: F, deadline: tokio::time::Instant, cancel: &CancellationToken) -> Guarded<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Guarded::Cancelled,
        res = tokio::time::timeout_at(deadline, fut) => match res {
            Ok(value) => Guarded::Done(value),
            Err(_) => Guarded::TimedOut,
        },
    }
}

/// Lossy UTF-8 capture of at most `cap` bytes, cut on a char boundary.
fn capture(bytes: &[u8], cap: usize) -> (String, bool) {
    let text = String::from_utf8_lossy(bytes);
    if bytes.len() <= cap && text.len() <= cap {
        return (text.into_owned(), false);
    }
    let mut end = cap.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (text[..end].to_string(), true)
}
