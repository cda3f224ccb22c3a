//! Mailbox boundary and a directory-backed implementation.
//!
//! The router only normalizes what a [`Mailbox`] returns; authentication and
//! the real mail provider live behind this trait.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value_to_string;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxOp {
    Read,
    Send,
}

impl MailboxOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Send => "send",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxReply {
    pub success: bool,
    pub payload: String,
    pub error: Option<String>,
}

impl MailboxReply {
    pub fn ok(payload: impl Into<String>) -> Self {
        Self {
            success: true,
            payload: payload.into(),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: String::new(),
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait Mailbox: Send + Sync {
    async fn invoke(
        &self,
        op: MailboxOp,
        params: &HashMap<String, serde_json::Value>,
    ) -> Result<MailboxReply>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub unread: bool,
}

impl MailMessage {
    fn matches(&self, needle: &str) -> bool {
        [&self.from, &self.subject, &self.body]
            .iter()
            .any(|field| field.to_lowercase().contains(needle))
    }
}

/// Messages live as JSON files: `<root>/inbox/*.json` are read, sent mail is
/// written to `<root>/outbox/<id>.json`.
#[derive(Debug, Clone)]
pub struct FileMailbox {
    pub root: PathBuf,
    pub sender: String,
}

impl FileMailbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sender: "syspilot@localhost".to_string(),
        }
    }

    async fn read(&self, params: &HashMap<String, serde_json::Value>) -> Result<MailboxReply> {
        let query = params
            .get("query")
            .and_then(value_to_string)
            .map(|q| q.trim().to_lowercase())
            .unwrap_or_default();
        let max_results = params
            .get("max_results")
            .and_then(value_to_string)
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(10);
        let unread_only = params
            .get("unread_only")
            .and_then(value_to_string)
            .is_some_and(|v| v == "true");

        let inbox = self.root.join("inbox");
        let mut messages = Vec::new();
        if tokio::fs::try_exists(&inbox).await? {
            let mut entries = tokio::fs::read_dir(&inbox).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let raw = tokio::fs::read_to_string(&path).await?;
                let message: MailMessage = serde_json::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("malformed message {}: {e}", path.display()))?;
                messages.push(message);
            }
        }

        messages.retain(|m| (!unread_only || m.unread) && (query.is_empty() || m.matches(&query)));
        messages.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        messages.truncate(max_results);

        Ok(MailboxReply::ok(serde_json::to_string_pretty(&messages)?))
    }

    async fn send(&self, params: &HashMap<String, serde_json::Value>) -> Result<MailboxReply> {
        let field = |key: &str| params.get(key).and_then(value_to_string).filter(|v| !v.trim().is_empty());
        let (Some(to), Some(subject), Some(body)) = (field("to"), field("subject"), field("body"))
        else {
            return Ok(MailboxReply::rejected("missing required params: to, subject, body"));
        };
        if !to.contains('@') {
            return Ok(MailboxReply::rejected(format!("'{to}' is not an email address")));
        }

        let message = MailMessage {
            id: uuid::Uuid::new_v4().to_string(),
            from: self.sender.clone(),
            to,
            subject,
            body,
            received_at: Utc::now(),
            unread: false,
        };

        let outbox = self.root.join("outbox");
        tokio::fs::create_dir_all(&outbox).await?;
        let path = outbox.join(format!("{}.json", message.id));
        if tokio::fs::try_exists(&path).await? {
            bail!("outbox entry {} already exists", path.display());
        }
        tokio::fs::write(&path, serde_json::to_string_pretty(&message)?).await?;

        Ok(MailboxReply::ok(format!(
            "message {} sent to {}",
            message.id, message.to
        )))
    }
}

#[async_trait]
impl Mailbox for FileMailbox {
    async fn invoke(
        &self,
        op: MailboxOp,
        params: &HashMap<String, serde_json::Value>,
    ) -> Result<MailboxReply> {
        match op {
            MailboxOp::Read => self.read(params).await,
            MailboxOp::Send => self.send(params).await,
        }
    }
}
