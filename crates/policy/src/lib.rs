//! Command safety policy.
//!
//! [`PolicyEngine::evaluate`] is a total, side-effect-free classification of a
//! candidate shell command.  The rule set is compiled once from
//! [`PolicyConfig`] and is read-only afterwards; nothing reachable from agent
//! input can change it.
//!
//! Evaluation order:
//!
//! 1. empty command → deny `empty-command`
//! 2. longer than `max_command_len` → deny `oversized-command`
//! 3. deny rules, first match wins → deny with the rule's reason
//! 4. control operators present and chaining disabled → deny `compound-command-rejected`
//! 5. allowlist mode: first matching allow rule → allow, otherwise deny `no-allow-rule-matched`
//! 6. blocklist mode → allow `no-deny-rule-matched`
//!
//! Deny rules run before the compound check so a chained command that also
//! contains a known-dangerous tool reports the more specific reason.

mod compound;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use syspilot_config::{DefaultDecision, PatternKind, PolicyConfig, RuleConfig};

pub use compound::find_control_operator;

pub const REASON_EMPTY: &str = "empty-command";
pub const REASON_OVERSIZED: &str = "oversized-command";
pub const REASON_COMPOUND: &str = "compound-command-rejected";
pub const REASON_NO_DENY_RULE: &str = "no-deny-rule-matched";
pub const REASON_NO_ALLOW_RULE: &str = "no-allow-rule-matched";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

/// The outcome of evaluating one command.  Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub decision: Decision,
    pub reason: String,
    pub matched_rule: Option<String>,
    /// The normalized command text this verdict was computed for.
    pub evaluated: String,
}

impl Verdict {
    fn allow(reason: &str, rule: Option<&Rule>, evaluated: String) -> Self {
        Self {
            decision: Decision::Allow,
            reason: reason.to_string(),
            matched_rule: rule.map(|r| r.id.clone()),
            evaluated,
        }
    }

    fn deny(reason: &str, rule: Option<&Rule>, evaluated: String) -> Self {
        Self {
            decision: Decision::Deny,
            reason: reason.to_string(),
            matched_rule: rule.map(|r| r.id.clone()),
            evaluated,
        }
    }

    pub fn is_allow(&self) -> bool {
        self.decision == Decision::Allow
    }

    /// `true` when this verdict was computed for `command`.
    pub fn covers(&self, command: &str) -> bool {
        self.evaluated == normalize(command)
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("rule '{id}' has an empty pattern")]
    EmptyPattern { id: String },
    #[error("rule '{id}' has an invalid regular expression: {source}")]
    InvalidPattern {
        id: String,
        #[source]
        source: regex::Error,
    },
    #[error("rule id '{0}' is used more than once")]
    DuplicateRuleId(String),
}

#[derive(Debug, Clone)]
enum Matcher {
    /// Lowercased, whitespace-collapsed needle.
    Literal(String),
    Prefix(String),
    Regex(Regex),
}

/// A compiled policy rule.
#[derive(Debug, Clone)]
pub struct Rule {
    id: String,
    reason: String,
    kind: PatternKind,
    pattern: String,
    matcher: Matcher,
}

impl Rule {
    fn compile(config: &RuleConfig) -> Result<Self, PolicyError> {
        if config.pattern.trim().is_empty() {
            return Err(PolicyError::EmptyPattern {
                id: config.id.clone(),
            });
        }
        let matcher = match config.kind {
            PatternKind::Literal => Matcher::Literal(normalize(&config.pattern).to_lowercase()),
            PatternKind::Prefix => Matcher::Prefix(normalize(&config.pattern).to_lowercase()),
            PatternKind::Regex => {
                let re = RegexBuilder::new(&config.pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| PolicyError::InvalidPattern {
                        id: config.id.clone(),
                        source,
                    })?;
                Matcher::Regex(re)
            }
        };
        Ok(Self {
            id: config.id.clone(),
            reason: config.reason.clone(),
            kind: config.kind,
            pattern: config.pattern.clone(),
            matcher,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    fn matches(&self, normalized: &str, lowered: &str) -> bool {
        match &self.matcher {
            Matcher::Literal(needle) => lowered.contains(needle.as_str()),
            Matcher::Prefix(prefix) => lowered.starts_with(prefix.as_str()),
            Matcher::Regex(re) => re.is_match(normalized),
        }
    }
}

/// Trim and collapse every whitespace run to a single space.
pub fn normalize(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The compiled, immutable safety policy.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    default_decision: DefaultDecision,
    allow_chaining: bool,
    max_command_len: usize,
    deny_rules: Vec<Rule>,
    allow_rules: Vec<Rule>,
}

impl PolicyEngine {
    pub fn from_config(config: &PolicyConfig) -> Result<Self, PolicyError> {
        let mut seen = std::collections::HashSet::new();
        for rule in config.deny_rules.iter().chain(&config.allow_rules) {
            if !seen.insert(rule.id.as_str()) {
                return Err(PolicyError::DuplicateRuleId(rule.id.clone()));
            }
        }

        let deny_rules = config
            .deny_rules
            .iter()
            .map(Rule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        let allow_rules = config
            .allow_rules
            .iter()
            .map(Rule::compile)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            default_decision: config.default_decision,
            allow_chaining: config.allow_chaining,
            max_command_len: config.max_command_len,
            deny_rules,
            allow_rules,
        })
    }

    pub fn default_decision(&self) -> DefaultDecision {
        self.default_decision
    }

    pub fn deny_rules(&self) -> &[Rule] {
        &self.deny_rules
    }

    pub fn allow_rules(&self) -> &[Rule] {
        &self.allow_rules
    }

    /// Classify `command`.  Deterministic and infallible.
    pub fn evaluate(&self, command: &str) -> Verdict {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return Verdict::deny(REASON_EMPTY, None, String::new());
        }
        if trimmed.len() > self.max_command_len {
            return Verdict::deny(REASON_OVERSIZED, None, normalize(trimmed));
        }

        let normalized = normalize(trimmed);
        let lowered = normalized.to_lowercase();

        if let Some(rule) = self
            .deny_rules
            .iter()
            .find(|r| r.matches(&normalized, &lowered))
        {
            debug!(rule = %rule.id, reason = %rule.reason, "deny rule matched");
            return Verdict::deny(&rule.reason, Some(rule), normalized);
        }

        // Scanned on the raw text: collapsing whitespace would hide newlines.
        if !self.allow_chaining {
            if let Some(op) = find_control_operator(trimmed) {
                debug!(operator = op, "compound command rejected");
                return Verdict::deny(REASON_COMPOUND, None, normalized);
            }
        }

        match self.default_decision {
            DefaultDecision::Deny => match self
                .allow_rules
                .iter()
                .find(|r| r.matches(&normalized, &lowered))
            {
                Some(rule) => Verdict::allow(&rule.reason, Some(rule), normalized),
                None => Verdict::deny(REASON_NO_ALLOW_RULE, None, normalized),
            },
            DefaultDecision::Allow => Verdict::allow(REASON_NO_DENY_RULE, None, normalized),
        }
    }
}
