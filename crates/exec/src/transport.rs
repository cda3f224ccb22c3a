//! The remote-control channel consumed by the executor.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Handle to an open control channel.  Cheap to clone; shared by every
/// execution on the same target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    pub target: String,
    pub opened_at: DateTime<Utc>,
}

impl Session {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.into(),
            opened_at: Utc::now(),
        }
    }
}

/// Identifier the transport assigns to a submitted command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub exit_status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Pending,
    Finished(RawOutput),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("session unreachable: {0}")]
    Unreachable(String),
    #[error("throttled by remote: {0}")]
    Throttled(String),
    /// The remote side reports the command never ran, so it is safe to resubmit.
    #[error("command not delivered: {0}")]
    NotDelivered(String),
    #[error("remote rejected the request: {0}")]
    Rejected(String),
    #[error("unknown execution {0}")]
    UnknownExecution(ExecutionId),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unreachable(_) | Self::Throttled(_) | Self::NotDelivered(_)
        )
    }
}

/// Session-based remote execution, submit then poll.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn open(&self) -> Result<Session, TransportError>;

    async fn submit(&self, session: &Session, command: &str) -> Result<ExecutionId, TransportError>;

    async fn poll(
        &self,
        session: &Session,
        execution: &ExecutionId,
    ) -> Result<PollStatus, TransportError>;

    /// Best effort; callers do not wait for the remote side to confirm.
    async fn cancel(&self, session: &Session, execution: &ExecutionId) -> Result<(), TransportError>;

    async fn close(&self, _session: &Session) -> Result<(), TransportError> {
        Ok(())
    }
}
