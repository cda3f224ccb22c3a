//! The concurrency harness between the interface thread and the tools.
//!
//! `submit` evaluates policy on the caller's thread and returns at once; the
//! rest happens on a worker task spawned through the captured runtime
//! [`Handle`].  Per invocation the order is fixed: the verdict is audited,
//! then the tool runs, then its result is audited, then the result is
//! delivered exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use syspilot_audit::{AuditEntry, AuditRecord, AuditSink};
use syspilot_exec::{ExecutionResult, Outcome};
use syspilot_policy::Verdict;
use syspilot_tools::{InvocationId, ToolInvocation, ToolName, ToolResult};

use crate::error::DispatchError;
use crate::router::{RoutePlan, Routed, ToolRouter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    Received,
    Evaluated,
    Denied,
    /// Waiting for or holding a worker slot.
    Executing,
    Completed,
    TimedOut,
    Cancelled,
    TransportError,
    /// Any other failure (unknown tool, mailbox error, invariant violation).
    Failed,
}

impl InvocationState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Received | Self::Evaluated | Self::Executing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Evaluated => "evaluated",
            Self::Denied => "denied",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::TransportError => "transport_error",
            Self::Failed => "failed",
        }
    }

    fn terminal_for(routed: &Routed) -> Self {
        if let Some(execution) = &routed.execution {
            return match execution.outcome {
                Outcome::Completed => Self::Completed,
                Outcome::TimedOut => Self::TimedOut,
                Outcome::Cancelled => Self::Cancelled,
                Outcome::TransportError => Self::TransportError,
            };
        }
        match &routed.error {
            None => Self::Completed,
            Some(DispatchError::PolicyDenied { .. }) => Self::Denied,
            Some(DispatchError::Cancelled) => Self::Cancelled,
            Some(DispatchError::TimedOut) => Self::TimedOut,
            Some(DispatchError::Transport(_)) => Self::TransportError,
            Some(_) => Self::Failed,
        }
    }
}

/// Notification sent on the completion channel, in completion order.
#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub invocation_id: InvocationId,
    pub tool: ToolName,
    pub state: InvocationState,
    pub result: ToolResult,
    pub execution: Option<ExecutionResult>,
    pub verdict: Option<Verdict>,
}

/// Returned by [`DispatchCoordinator::submit`].  Resolves exactly once.
#[derive(Debug)]
pub struct DispatchHandle {
    invocation_id: InvocationId,
    rx: oneshot::Receiver<ToolResult>,
}

impl DispatchHandle {
    pub fn invocation_id(&self) -> &InvocationId {
        &self.invocation_id
    }

    pub async fn wait(self) -> ToolResult {
        self.rx.await.unwrap_or_else(|_| {
            DispatchError::InternalInvariantViolation("worker ended without a result".to_string())
                .to_tool_result()
        })
    }

    /// Non-blocking check; `None` while the invocation is still running.
    pub fn try_result(&mut self) -> Option<ToolResult> {
        self.rx.try_recv().ok()
    }
}

struct Slot {
    state: InvocationState,
    cancel: CancellationToken,
}

struct Inner {
    router: Arc<ToolRouter>,
    audit: Arc<dyn AuditSink>,
    runtime: Handle,
    permits: Arc<Semaphore>,
    // Terminal entries stay so an id can never be reused.
    slots: Mutex<HashMap<InvocationId, Slot>>,
    completions: mpsc::UnboundedSender<Completion>,
}

#[derive(Clone)]
pub struct DispatchCoordinator {
    inner: Arc<Inner>,
}

impl DispatchCoordinator {
    /// Build a coordinator and the receiving end of its completion channel.
    pub fn new(
        router: Arc<ToolRouter>,
        audit: Arc<dyn AuditSink>,
        max_concurrent: usize,
        runtime: Handle,
    ) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (completions, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            router,
            audit,
            runtime,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            slots: Mutex::new(HashMap::new()),
            completions,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn router(&self) -> &ToolRouter {
        &self.inner.router
    }

    /// Accept an invocation.  Never blocks on remote I/O and may be called
    /// from any thread.
    pub fn submit(&self, invocation: ToolInvocation) -> Result<DispatchHandle, DispatchError> {
        let id = invocation.invocation_id.clone();
        let cancel = CancellationToken::new();

        {
            let mut slots = self.inner.lock_slots()?;
            if slots.contains_key(&id) {
                drop(slots);
                error!(invocation_id = %id, tool = %invocation.tool_name, "duplicate invocation id rejected");
                let err = DispatchError::DuplicateInvocation(id.clone());
                let record = syspilot_audit::record(
                    id.as_str(),
                    invocation.tool_name.as_str(),
                    invocation.summary(),
                    AuditEntry::Rejected {
                        error: err.to_string(),
                    },
                );
                let inner = Arc::clone(&self.inner);
                self.inner.runtime.spawn(async move { inner.write_audit(&record).await });
                return Err(err);
            }
            slots.insert(
                id.clone(),
                Slot {
                    state: InvocationState::Received,
                    cancel: cancel.clone(),
                },
            );
        }
        debug!(invocation_id = %id, tool = %invocation.tool_name, "invocation received");

        let plan = self.inner.router.prepare(&invocation);
        self.inner.set_state(&id, InvocationState::Evaluated);

        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.inner
            .runtime
            .spawn(async move { inner.work(invocation, plan, cancel, tx).await });

        Ok(DispatchHandle {
            invocation_id: id,
            rx,
        })
    }

    /// Request cancellation.  Honored only while the invocation is executing;
    /// returns whether the request was accepted.
    ///
    /// Checked under the same lock as the terminal transition, so once a
    /// result is recorded every later cancel is refused.  An accepted cancel
    /// that races a command already returning its output does not undo it:
    /// the delivered [`Completion::state`] is authoritative.
    pub fn cancel(&self, invocation_id: &InvocationId) -> bool {
        let Ok(slots) = self.inner.slots.lock() else {
            return false;
        };
        match slots.get(invocation_id) {
            Some(slot) if slot.state == InvocationState::Executing => {
                slot.cancel.cancel();
                info!(invocation_id = %invocation_id, "cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Cancel everything still executing.  Used on shutdown.
    pub fn cancel_all(&self) -> usize {
        let Ok(slots) = self.inner.slots.lock() else {
            return 0;
        };
        let mut cancelled = 0;
        for slot in slots.values() {
            if slot.state == InvocationState::Executing {
                slot.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn state(&self, invocation_id: &InvocationId) -> Option<InvocationState> {
        self.inner
            .slots
            .lock()
            .ok()?
            .get(invocation_id)
            .map(|slot| slot.state)
    }

    /// Invocations that have not reached a terminal state, sorted by id.
    pub fn in_flight(&self) -> Vec<(InvocationId, InvocationState)> {
        let Ok(slots) = self.inner.slots.lock() else {
            return Vec::new();
        };
        let mut pending: Vec<_> = slots
            .iter()
            .filter(|(_, slot)| !slot.state.is_terminal())
            .map(|(id, slot)| (id.clone(), slot.state))
            .collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0));
        pending
    }
}

impl Inner {
    fn lock_slots(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<InvocationId, Slot>>, DispatchError> {
        self.slots.lock().map_err(|_| {
            DispatchError::InternalInvariantViolation("invocation table lock poisoned".to_string())
        })
    }

    /// Record the terminal state as soon as the run returns, before auditing
    /// and delivery.  Returns the state that stands.
    fn finish(&self, id: &InvocationId, state: InvocationState) -> InvocationState {
        let Ok(mut slots) = self.slots.lock() else {
            error!(invocation_id = %id, "invocation table lock poisoned");
            return state;
        };
        match slots.get_mut(id) {
            Some(slot) if slot.state.is_terminal() => slot.state,
            Some(slot) => {
                if slot.cancel.is_cancelled() && state == InvocationState::Completed {
                    info!(invocation_id = %id, "cancellation arrived after the command finished");
                }
                slot.state = state;
                state
            }
            None => state,
        }
    }

    /// Move `id` to `state` unless it already reached a terminal one.
    fn set_state(&self, id: &InvocationId, state: InvocationState) {
        let Ok(mut slots) = self.slots.lock() else {
            error!(invocation_id = %id, "invocation table lock poisoned");
            return;
        };
        match slots.get_mut(id) {
            Some(slot) if !slot.state.is_terminal() => slot.state = state,
            _ => {}
        }
    }

    async fn write_audit(&self, record: &AuditRecord) {
        if let Err(err) = self.audit.append(record).await {
            error!(
                invocation_id = %record.invocation_id,
                kind = record.entry.kind(),
                error = %err,
                "audit append failed"
            );
        }
    }

    async fn work(
        self: Arc<Self>,
        invocation: ToolInvocation,
        plan: RoutePlan,
        cancel: CancellationToken,
        tx: oneshot::Sender<ToolResult>,
    ) {
        let id = invocation.invocation_id.clone();
        let tool = invocation.tool_name.clone();
        let request_text = plan
            .request()
            .map(|r| r.raw_text.clone())
            .unwrap_or_else(|| invocation.summary());
        let verdict = plan.verdict().cloned();

        if let Some(verdict) = &verdict {
            let entry = AuditEntry::Verdict {
                decision: verdict.decision.as_str().to_string(),
                reason: verdict.reason.clone(),
                matched_rule: verdict.matched_rule.clone(),
            };
            self.write_audit(&syspilot_audit::record(id.as_str(), tool.as_str(), &request_text, entry))
                .await;
        }

        let routed = if plan.is_executable() {
            self.set_state(&id, InvocationState::Executing);
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(DispatchError::Cancelled),
                permit = Arc::clone(&self.permits).acquire_owned() => permit.map_err(|_| {
                    DispatchError::InternalInvariantViolation("worker pool closed".to_string())
                }),
            };
            match permit {
                Ok(_permit) => self.router.run(plan, &cancel).await,
                Err(err) => Routed::failed(err),
            }
        } else {
            self.router.run(plan, &cancel).await
        };

        let state = self.finish(&id, InvocationState::terminal_for(&routed));
        if let Some(entry) = result_entry(&routed, state) {
            self.write_audit(&syspilot_audit::record(id.as_str(), tool.as_str(), &request_text, entry))
                .await;
        }
        if routed.error.as_ref().is_some_and(DispatchError::is_internal) {
            error!(invocation_id = %id, error = ?routed.result.error, "invocation failed on an internal invariant");
        }

        info!(
            invocation_id = %id,
            tool = %tool,
            state = state.as_str(),
            success = routed.result.success,
            "invocation finished"
        );

        let completion = Completion {
            invocation_id: id,
            tool,
            state,
            result: routed.result.clone(),
            execution: routed.execution,
            verdict,
        };
        // Receivers may have gone away; delivery to the rest still happens.
        let _ = self.completions.send(completion);
        let _ = tx.send(routed.result);
    }
}

/// The terminal audit entry, if any.  A denial is fully described by its verdict.
fn result_entry(routed: &Routed, state: InvocationState) -> Option<AuditEntry> {
    if state == InvocationState::Denied {
        return None;
    }
    let entry = match &routed.execution {
        Some(execution) => AuditEntry::Execution {
            outcome: execution.outcome.as_str().to_string(),
            exit_status: (execution.outcome == Outcome::Completed).then_some(execution.exit_status),
            duration_ms: execution.duration.as_millis() as u64,
            attempts: execution.attempts,
            started_at: execution.started_at,
            finished_at: execution.finished_at,
            output_truncated: execution.truncated(),
            error: execution.error.clone(),
        },
        None => AuditEntry::ToolCompleted {
            success: routed.result.success,
            error: routed.result.error.clone(),
        },
    };
    Some(entry)
}
