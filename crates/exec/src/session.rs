//! Process-wide session handle with an explicit concurrency discipline.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use syspilot_config::SessionMode;

use crate::transport::{ExecutionId, PollStatus, RemoteTransport, Session, TransportError};

/// Owns the single shared [`Session`].
///
/// The session is opened lazily (or eagerly via [`SessionManager::open`]) and
/// reused until it is invalidated or closed.  In [`SessionMode::Serialized`]
/// every transport call runs inside one critical section; in
/// [`SessionMode::Concurrent`] calls go straight to the transport.
pub struct SessionManager {
    transport: Arc<dyn RemoteTransport>,
    mode: SessionMode,
    slot: Mutex<Option<Session>>,
    call_lock: Mutex<()>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn RemoteTransport>, mode: SessionMode) -> Self {
        Self {
            transport,
            mode,
            slot: Mutex::new(None),
            call_lock: Mutex::new(()),
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Return the open session, opening it first if needed.
    pub async fn open(&self) -> Result<Session, TransportError> {
        let mut slot = self.slot.lock().await;
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }
        let session = {
            let _guard = self.serialize().await;
            self.transport.open().await?
        };
        info!(session = %session.id, target = %session.target, "remote session opened");
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Forget the cached session so the next call reopens it.
    pub async fn invalidate(&self) {
        if let Some(old) = self.slot.lock().await.take() {
            debug!(session = %old.id, "remote session invalidated");
        }
    }

    pub async fn close(&self) {
        let Some(session) = self.slot.lock().await.take() else {
            return;
        };
        let _guard = self.serialize().await;
        match self.transport.close(&session).await {
            Ok(()) => info!(session = %session.id, "remote session closed"),
            Err(err) => warn!(session = %session.id, %err, "remote session close failed"),
        }
    }

    pub async fn submit(&self, command: &str) -> Result<ExecutionId, TransportError> {
        let session = self.open().await?;
        let _guard = self.serialize().await;
        self.transport.submit(&session, command).await
    }

    pub async fn poll(&self, execution: &ExecutionId) -> Result<PollStatus, TransportError> {
        let session = self.open().await?;
        let _guard = self.serialize().await;
        self.transport.poll(&session, execution).await
    }

    pub async fn cancel(&self, execution: &ExecutionId) -> Result<(), TransportError> {
        let session = self.open().await?;
        let _guard = self.serialize().await;
        self.transport.cancel(&session, execution).await
    }

    async fn serialize(&self) -> Option<MutexGuard<'_, ()>> {
        match self.mode {
            SessionMode::Serialized => Some(self.call_lock.lock().await),
            SessionMode::Concurrent => None,
        }
    }
}
