//! Wires the configured components into a running dispatch pipeline.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::info;

use syspilot_audit::{AuditSink, JsonlAuditLog, MemoryAuditLog};
use syspilot_config::AppConfig;
use syspilot_dispatch::{Completion, DispatchCoordinator, ToolRouter};
use syspilot_exec::{ExecutorSettings, ProcessTransport, RemoteExecutor, SessionManager};
use syspilot_policy::PolicyEngine;
use syspilot_tools::FileMailbox;

pub(crate) struct Pipeline {
    pub coordinator: DispatchCoordinator,
    pub completions: mpsc::UnboundedReceiver<Completion>,
    pub sessions: Arc<SessionManager>,
}

impl Pipeline {
    pub async fn build(config: &AppConfig) -> Result<Self> {
        let policy = Arc::new(
            PolicyEngine::from_config(&config.policy).context("invalid policy configuration")?,
        );

        let transport = Arc::new(ProcessTransport::from_config(&config.remote));
        let sessions = Arc::new(SessionManager::new(transport, config.remote.session_mode));
        if config.remote.open_on_startup {
            sessions
                .open()
                .await
                .with_context(|| format!("failed to open session to {}", config.remote.target))?;
        }

        let executor = Arc::new(RemoteExecutor::new(
            Arc::clone(&sessions),
            ExecutorSettings::from(&config.executor),
        ));

        let mut router = ToolRouter::new(policy, executor);
        if config.mailbox.enabled {
            router = router.with_mailbox(Arc::new(FileMailbox::new(&config.mailbox.root)));
        }

        let audit: Arc<dyn AuditSink> = if config.audit.enabled {
            Arc::new(JsonlAuditLog::new(&config.audit.path))
        } else {
            Arc::new(MemoryAuditLog::default())
        };

        let (coordinator, completions) = DispatchCoordinator::new(
            Arc::new(router),
            audit,
            config.dispatch.max_concurrent,
            Handle::current(),
        );

        info!(
            target_host = %config.remote.target,
            session_mode = ?config.remote.session_mode,
            max_concurrent = config.dispatch.max_concurrent,
            "dispatch pipeline ready"
        );

        Ok(Self {
            coordinator,
            completions,
            sessions,
        })
    }

    pub async fn shutdown(&self) {
        let cancelled = self.coordinator.cancel_all();
        if cancelled > 0 {
            info!(cancelled, "cancelled in-flight invocations on shutdown");
        }
        self.sessions.close().await;
    }
}
