use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One line of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub invocation_id: String,
    pub tool: String,
    /// The command text or a summary of the tool parameters.
    pub request_text: String,
    pub entry: AuditEntry,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEntry {
    /// A policy decision, written for allowed and denied commands alike.
    Verdict {
        decision: String,
        reason: String,
        matched_rule: Option<String>,
    },
    /// The terminal result of a remote execution.
    Execution {
        outcome: String,
        exit_status: Option<i32>,
        duration_ms: u64,
        attempts: u32,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        output_truncated: bool,
        error: Option<String>,
    },
    /// The terminal result of any other tool.
    ToolCompleted {
        success: bool,
        error: Option<String>,
    },
    /// An invocation refused before evaluation (e.g. a reused invocation id).
    Rejected { error: String },
}

impl AuditEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Verdict { .. } => "verdict",
            Self::Execution { .. } => "execution",
            Self::ToolCompleted { .. } => "tool_completed",
            Self::Rejected { .. } => "rejected",
        }
    }
}
