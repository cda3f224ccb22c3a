use thiserror::Error;

use syspilot_exec::ExecError;
use syspilot_tools::{InvocationId, ToolResult};

/// Every way an invocation can fail to produce a successful result.
///
/// None of these reach the interface directly: they are rendered into a
/// [`ToolResult`] with `success = false` by [`DispatchError::to_tool_result`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Expected and user-visible.  `reason` is the matched rule's reason, verbatim.
    #[error("{reason}")]
    PolicyDenied {
        reason: String,
        matched_rule: Option<String>,
    },

    #[error("transport-error: {0}")]
    Transport(String),

    #[error("timed-out")]
    TimedOut,

    #[error("cancelled")]
    Cancelled,

    #[error("internal-invariant-violation: {0}")]
    InternalInvariantViolation(String),

    #[error("duplicate invocation id {0}")]
    DuplicateInvocation(InvocationId),

    #[error("unknown-tool")]
    UnknownTool(String),

    #[error("mailbox-unavailable")]
    MailboxUnavailable,

    #[error("mailbox-error: {0}")]
    Mailbox(String),
}

impl DispatchError {
    pub fn to_tool_result(&self) -> ToolResult {
        ToolResult::failure(self.to_string())
    }

    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::InternalInvariantViolation(_) | Self::DuplicateInvocation(_)
        )
    }
}

impl From<ExecError> for DispatchError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::InvariantViolation(msg) => Self::InternalInvariantViolation(msg),
        }
    }
}
