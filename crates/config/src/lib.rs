use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

// ── Policy ───────────────────────────────────────────────────────────────────

/// What the policy engine answers when no rule matches a command.
///
/// | Decision | Behaviour                                                        |
/// |----------|------------------------------------------------------------------|
/// | `allow`  | Blocklist mode: only `deny_rules` can stop a command.            |
/// | `deny`   | Allowlist mode: a command must match one of the `allow_rules`.   |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultDecision {
    #[default]
    Allow,
    Deny,
}

impl DefaultDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

/// How a rule's `pattern` is compared against the normalized command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    /// Substring anywhere in the command.
    Literal,
    /// The command starts with the pattern.
    Prefix,
    #[default]
    Regex,
}

impl PatternKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Literal => "literal",
            Self::Prefix => "prefix",
            Self::Regex => "regex",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    #[serde(default)]
    pub kind: PatternKind,
    pub pattern: String,
    /// Surfaced verbatim to the agent and the audit trail when the rule matches.
    pub reason: String,
}

impl RuleConfig {
    pub fn new(
        id: impl Into<String>,
        kind: PatternKind,
        pattern: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub default_decision: DefaultDecision,
    /// Permit commands chained with control operators (`;`, `&&`, `|`, ...).
    /// Off by default: a compound command is rejected without analysis.
    pub allow_chaining: bool,
    /// Commands longer than this many bytes are denied.
    pub max_command_len: usize,
    /// Ordered; the first matching rule wins.
    pub deny_rules: Vec<RuleConfig>,
    /// Consulted only when `default_decision = "deny"`.
    pub allow_rules: Vec<RuleConfig>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_decision: DefaultDecision::Allow,
            allow_chaining: false,
            max_command_len: 4096,
            deny_rules: vec![
                RuleConfig::new("curl", PatternKind::Regex, r"\bcurl\b", "network-fetch-tool"),
                RuleConfig::new("wget", PatternKind::Regex, r"\bwget\b", "network-fetch-tool"),
                RuleConfig::new("unset", PatternKind::Regex, r"\bunset\b", "unset-env-risk"),
            ],
            allow_rules: vec![],
        }
    }
}

// ── Remote target ────────────────────────────────────────────────────────────

/// Whether calls on the shared session must be serialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// One transport call at a time across all invocations.
    #[default]
    Serialized,
    /// The transport is safe for concurrent use.
    Concurrent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Host passed to `ssh`, or `local` to run commands with `sh -c` on this machine.
    /// Overridden by `SYSPILOT_TARGET` (or the legacy `INSTANCE_ID`).
    pub target: String,
    /// Extra `ssh` arguments placed before the target.
    pub ssh_options: Vec<String>,
    pub session_mode: SessionMode,
    /// Open the session at startup instead of on the first command.
    pub open_on_startup: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            target: "local".to_string(),
            ssh_options: vec!["-o".to_string(), "BatchMode=yes".to_string()],
            session_mode: SessionMode::Serialized,
            open_on_startup: false,
        }
    }
}

impl RemoteConfig {
    pub fn is_local(&self) -> bool {
        self.target.eq_ignore_ascii_case("local")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub default_timeout_secs: u64,
    /// Upper bound for a per-invocation `timeout_secs` requested by the agent.
    pub max_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Total transport attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Per-stream capture cap for stdout and stderr.
    pub max_output_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 90,
            max_timeout_secs: 600,
            poll_interval_ms: 1000,
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5000,
            max_output_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Worker slots; invocations beyond this wait for a free slot.
    pub max_concurrent: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { max_concurrent: 8 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: ".syspilot/audit.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    pub enabled: bool,
    /// Directory holding `inbox/` and `outbox/`.
    pub root: String,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: ".syspilot/mailbox".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub policy: PolicyConfig,
    pub remote: RemoteConfig,
    pub executor: ExecutorConfig,
    pub dispatch: DispatchConfig,
    pub audit: AuditConfig,
    pub mailbox: MailboxConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        // Legacy name first so the explicit variable wins when both are set.
        for key in ["INSTANCE_ID", "SYSPILOT_TARGET"] {
            if let Ok(value) = env::var(key) {
                if !value.is_empty() {
                    config.remote.target = value;
                }
            }
        }

        if let Ok(value) = env::var("SYSPILOT_AUDIT_PATH") {
            if !value.is_empty() {
                config.audit.path = value;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let exec = &self.executor;
        if exec.max_attempts == 0 {
            bail!("executor.max_attempts must be at least 1");
        }
        if exec.poll_interval_ms == 0 {
            bail!("executor.poll_interval_ms must be greater than 0");
        }
        if exec.default_timeout_secs == 0 || exec.default_timeout_secs > exec.max_timeout_secs {
            bail!(
                "executor.default_timeout_secs ({}) must be between 1 and max_timeout_secs ({})",
                exec.default_timeout_secs,
                exec.max_timeout_secs
            );
        }
        if self.dispatch.max_concurrent == 0 {
            bail!("dispatch.max_concurrent must be at least 1");
        }
        if self.policy.max_command_len == 0 {
            bail!("policy.max_command_len must be greater than 0");
        }
        if self.remote.target.trim().is_empty() {
            bail!("remote.target must not be empty (use \"local\" for this machine)");
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    // ── Security-critical defaults ────────────────────────────────────────
    // Changing any of these values should be a deliberate, reviewed decision.

    #[test]
    fn security_defaults_reject_chaining_and_ship_fetch_rules() {
        let cfg = AppConfig::default();
        assert!(!cfg.policy.allow_chaining, "allow_chaining must default to false");
        assert_eq!(cfg.policy.default_decision, DefaultDecision::Allow);
        let reasons: Vec<&str> = cfg
            .policy
            .deny_rules
            .iter()
            .map(|r| r.reason.as_str())
            .collect();
        assert_eq!(reasons, ["network-fetch-tool", "network-fetch-tool", "unset-env-risk"]);
        assert_eq!(cfg.remote.session_mode, SessionMode::Serialized);
    }

    #[test]
    fn functional_defaults() {
        let cfg = AppConfig::default();
        assert!(cfg.remote.is_local());
        assert!(!cfg.remote.open_on_startup);
        assert_eq!(cfg.executor.max_attempts, 3);
        assert_eq!(cfg.executor.default_timeout_secs, 90);
        assert_eq!(cfg.dispatch.max_concurrent, 8);
        assert_eq!(cfg.audit.path, ".syspilot/audit.jsonl");
        assert_eq!(cfg.telemetry.log_level, "info");
        assert!(cfg.validate().is_ok());
    }

    // ── load_from ──────────────────────────────────────────────────────────

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.policy.max_command_len, 4096);
        assert_eq!(cfg.executor.poll_interval_ms, 1000);
    }

    #[test]
    fn load_from_valid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.toml");
        fs::write(
            &path,
            r#"
[policy]
default_decision = "deny"
allow_chaining = true

[[policy.deny_rules]]
id = "rm-root"
kind = "prefix"
pattern = "rm -rf /"
reason = "destructive-delete"

[[policy.allow_rules]]
id = "systemctl-status"
kind = "prefix"
pattern = "systemctl status"
reason = "service-inspection"

[remote]
target = "ops@bastion"
session_mode = "concurrent"

[executor]
max_attempts = 5
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.policy.default_decision, DefaultDecision::Deny);
        assert!(cfg.policy.allow_chaining);
        assert_eq!(cfg.policy.deny_rules.len(), 1);
        assert_eq!(cfg.policy.deny_rules[0].kind, PatternKind::Prefix);
        assert_eq!(cfg.policy.allow_rules[0].reason, "service-inspection");
        assert_eq!(cfg.remote.session_mode, SessionMode::Concurrent);
        assert_eq!(cfg.executor.max_attempts, 5);
        // Unspecified fields keep their defaults
        assert_eq!(cfg.executor.poll_interval_ms, 1000);
        assert_eq!(cfg.dispatch.max_concurrent, 8);
    }

    #[test]
    fn rule_kind_defaults_to_regex() {
        let rule: RuleConfig = toml::from_str(
            r#"
id = "shutdown"
pattern = "\\bshutdown\\b"
reason = "host-shutdown"
"#,
        )
        .unwrap();
        assert_eq!(rule.kind, PatternKind::Regex);
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let shipped: AppConfig = toml::from_str(include_str!("../../../config/default.toml")).unwrap();
        let defaults = AppConfig::default();
        assert_eq!(shipped.policy.deny_rules, defaults.policy.deny_rules);
        assert_eq!(shipped.policy.default_decision, defaults.policy.default_decision);
        assert_eq!(shipped.remote.ssh_options, defaults.remote.ssh_options);
        assert_eq!(shipped.executor.max_output_bytes, defaults.executor.max_output_bytes);
        assert_eq!(shipped.audit.path, defaults.audit.path);
        shipped.validate().unwrap();
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn load_from_rejects_zero_attempts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("zero.toml");
        fs::write(&path, "[executor]\nmax_attempts = 0\n").unwrap();
        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn validate_rejects_default_timeout_above_max() {
        let mut cfg = AppConfig::default();
        cfg.executor.default_timeout_secs = 900;
        assert!(cfg.validate().is_err());
    }

    // ── save_to + roundtrip ────────────────────────────────────────────────

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/config.toml");

        let mut cfg = AppConfig::default();
        cfg.policy.default_decision = DefaultDecision::Deny;
        cfg.policy.allow_rules = vec![RuleConfig::new(
            "uptime",
            PatternKind::Literal,
            "uptime",
            "read-only",
        )];
        cfg.dispatch.max_concurrent = 2;

        cfg.save_to(&path).unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.policy.default_decision, DefaultDecision::Deny);
        assert_eq!(loaded.policy.allow_rules, cfg.policy.allow_rules);
        assert_eq!(loaded.policy.deny_rules, cfg.policy.deny_rules);
        assert_eq!(loaded.dispatch.max_concurrent, 2);
    }

    // ── serde labels ───────────────────────────────────────────────────────

    #[test]
    fn enum_labels_are_lowercase() {
        assert_eq!(serde_json::to_string(&DefaultDecision::Deny).unwrap(), "\"deny\"");
        assert_eq!(serde_json::to_string(&PatternKind::Prefix).unwrap(), "\"prefix\"");
        assert_eq!(
            serde_json::to_string(&SessionMode::Concurrent).unwrap(),
            "\"concurrent\""
        );
    }

    // ── Env var overrides ──────────────────────────────────────────────────

    #[test]
    fn env_overrides_target_and_audit_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("env.toml");
        fs::write(&path, "[remote]\ntarget = \"from-file\"\n").unwrap();

        // SAFETY: the only test in this crate touching these variables.
        unsafe {
            env::set_var("SYSPILOT_TARGET", "from-env");
            env::set_var("SYSPILOT_AUDIT_PATH", "/tmp/syspilot-audit.jsonl");
        }
        let cfg = AppConfig::load_from(&path).unwrap();
        unsafe {
            env::remove_var("SYSPILOT_TARGET");
            env::remove_var("SYSPILOT_AUDIT_PATH");
        }
        assert_eq!(cfg.remote.target, "from-env");
        assert_eq!(cfg.audit.path, "/tmp/syspilot-audit.jsonl");
    }
}
