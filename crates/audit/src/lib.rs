//! Append-only audit trail for policy verdicts and execution results.
//!
//! Records are keyed by invocation id and are never rewritten.  The file
//! backend writes one JSON object per line and fsyncs after every append.

pub mod events;

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;

pub use crate::events::{AuditEntry, AuditRecord};

/// Destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> Result<()>;
}

pub fn record(
    invocation_id: impl Into<String>,
    tool: impl Into<String>,
    request_text: impl Into<String>,
    entry: AuditEntry,
) -> AuditRecord {
    AuditRecord {
        invocation_id: invocation_id.into(),
        tool: tool.into(),
        request_text: request_text.into(),
        entry,
        recorded_at: Utc::now(),
    }
}

// ── JSONL file ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct JsonlAuditLog {
    path: PathBuf,
    // Keeps concurrent appends from interleaving within a line.
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record back, oldest first.  A missing file is an empty trail.
    pub fn read_all(&self) -> Result<Vec<AuditRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.path)?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl AuditSink for JsonlAuditLog {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}

// ── In-memory ────────────────────────────────────────────────────────────────

/// Keeps records in memory; used when the file trail is disabled and in tests.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn for_invocation(&self, invocation_id: &str) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.invocation_id == invocation_id)
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| anyhow::anyhow!("audit log lock poisoned"))?
            .push(record.clone());
        Ok(())
    }
}
