use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod mailbox;

pub use mailbox::{FileMailbox, MailMessage, Mailbox, MailboxOp, MailboxReply};

// ── Tool names ───────────────────────────────────────────────────────────────

/// The closed set of tools the router serves.
///
/// Names the agent emits that are not in this set parse to `Unknown` and are
/// answered with an `unknown-tool` result instead of failing the turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ToolName {
    RunCommand,
    MailboxRead,
    MailboxSend,
    TodayDate,
    Unknown(String),
}

impl ToolName {
    pub fn known() -> [ToolName; 4] {
        [
            ToolName::RunCommand,
            ToolName::MailboxRead,
            ToolName::MailboxSend,
            ToolName::TodayDate,
        ]
    }

    pub fn parse(name: &str) -> Self {
        match name.trim() {
            "run_command" => Self::RunCommand,
            "mailbox_read" => Self::MailboxRead,
            "mailbox_send" => Self::MailboxSend,
            "today_date" => Self::TodayDate,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::RunCommand => "run_command",
            Self::MailboxRead => "mailbox_read",
            Self::MailboxSend => "mailbox_send",
            Self::TodayDate => "today_date",
            Self::Unknown(name) => name,
        }
    }

    /// Schema advertised to the model.  `None` for unknown names.
    pub fn spec(&self) -> Option<ToolSpec> {
        let spec = match self {
            Self::RunCommand => ToolSpec {
                name: self.as_str().to_string(),
                description: "Run a single shell command on the managed host. \
                    The command is checked against the safety policy first; \
                    chained commands (`;`, `&&`, `|`) are rejected."
                    .to_string(),
                params: vec![
                    ToolParam::required("command", "Shell command to execute"),
                    ToolParam {
                        name: "timeout_secs".to_string(),
                        description: "Max execution time in seconds".to_string(),
                        param_type: ParamType::Integer,
                        ..Default::default()
                    },
                ],
            },
            Self::MailboxRead => ToolSpec {
                name: self.as_str().to_string(),
                description: "Search the operator mailbox. Returns matching messages, newest first."
                    .to_string(),
                params: vec![
                    ToolParam::optional("query", "Case-insensitive text to match in sender, subject or body"),
                    ToolParam {
                        name: "max_results".to_string(),
                        description: "Maximum number of messages to return".to_string(),
                        param_type: ParamType::Integer,
                        default: Some("10".to_string()),
                        ..Default::default()
                    },
                    ToolParam {
                        name: "unread_only".to_string(),
                        description: "Only return unread messages".to_string(),
                        param_type: ParamType::Boolean,
                        default: Some("false".to_string()),
                        ..Default::default()
                    },
                ],
            },
            Self::MailboxSend => ToolSpec {
                name: self.as_str().to_string(),
                description: "Send an email. Confirm the recipient address with the operator first."
                    .to_string(),
                params: vec![
                    ToolParam::required("to", "Recipient email address"),
                    ToolParam::required("subject", "Email subject line"),
                    ToolParam::required("body", "Email body text"),
                ],
            },
            Self::TodayDate => ToolSpec {
                name: self.as_str().to_string(),
                description: "Return today's date in YYYY-MM-DD format.".to_string(),
                params: vec![],
            },
            Self::Unknown(_) => return None,
        };
        Some(spec)
    }
}

impl From<String> for ToolName {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<ToolName> for String {
    fn from(value: ToolName) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Tool schemas ─────────────────────────────────────────────────────────────

/// JSON-friendly type hint for a tool parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    String,
    Integer,
    Boolean,
}

/// Describes a single parameter that a tool accepts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    pub description: String,
    pub required: bool,
    #[serde(default)]
    pub param_type: ParamType,
    /// Default value expressed as a string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl ToolParam {
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: true,
            ..Default::default()
        }
    }

    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ..Default::default()
        }
    }
}

/// Static metadata about a tool, used by the model to decide which tool to call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ToolParam>,
}

impl ToolSpec {
    /// Generate the OpenAI-compatible `tools` array element for this tool.
    ///
    /// ```json
    /// {
    ///   "type": "function",
    ///   "function": {
    ///     "name": "run_command",
    ///     "description": "...",
    ///     "parameters": { "type": "object", "properties": { ... }, "required": [...] }
    ///   }
    /// }
    /// ```
    pub fn to_openai_tool_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        let mut required: Vec<String> = Vec::new();

        for p in &self.params {
            let type_str = match p.param_type {
                ParamType::String => "string",
                ParamType::Integer => "integer",
                ParamType::Boolean => "boolean",
            };
            let mut prop = serde_json::json!({
                "type": type_str,
                "description": p.description,
            });
            if let Some(ref def) = p.default {
                // Emit the default as its JSON type rather than always a string.
                prop["default"] = match p.param_type {
                    ParamType::Integer => def
                        .parse::<i64>()
                        .map(|n| serde_json::json!(n))
                        .unwrap_or_else(|_| serde_json::Value::String(def.clone())),
                    ParamType::Boolean => match def.as_str() {
                        "true" => serde_json::json!(true),
                        "false" => serde_json::json!(false),
                        _ => serde_json::Value::String(def.clone()),
                    },
                    ParamType::String => serde_json::Value::String(def.clone()),
                };
            }
            properties.insert(p.name.clone(), prop);
            if p.required {
                required.push(p.name.clone());
            }
        }

        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }
            }
        })
    }
}

/// The `tools` array for every known tool, ready to bind to the model.
pub fn openai_tools() -> serde_json::Value {
    serde_json::Value::Array(
        ToolName::known()
            .iter()
            .filter_map(ToolName::spec)
            .map(|s| s.to_openai_tool_schema())
            .collect(),
    )
}

// ── Invocations and results ──────────────────────────────────────────────────

/// Correlates an asynchronous result with the tool call that caused it.
/// Unique for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(String);

impl InvocationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tool call emitted by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub invocation_id: InvocationId,
    pub tool_name: ToolName,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    /// Agent turn that emitted this call.
    #[serde(default)]
    pub requested_by: String,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl ToolInvocation {
    pub fn new(invocation_id: InvocationId, tool_name: ToolName) -> Self {
        Self {
            invocation_id,
            tool_name,
            parameters: HashMap::new(),
            requested_by: String::new(),
            received_at: Utc::now(),
        }
    }

    /// Build from a model tool call (`id`, `function.name`, `function.arguments`).
    /// Non-object arguments yield an empty parameter map.
    pub fn from_tool_call(
        id: impl Into<String>,
        name: &str,
        arguments: &serde_json::Value,
        turn: impl Into<String>,
    ) -> Self {
        let parameters = arguments
            .as_object()
            .map(|o| o.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Self {
            invocation_id: InvocationId::new(id),
            tool_name: ToolName::parse(name),
            parameters,
            requested_by: turn.into(),
            received_at: Utc::now(),
        }
    }

    pub fn run_command(invocation_id: InvocationId, command: impl Into<String>) -> Self {
        Self::new(invocation_id, ToolName::RunCommand)
            .with_param("command", serde_json::Value::String(command.into()))
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_turn(mut self, turn: impl Into<String>) -> Self {
        self.requested_by = turn.into();
        self
    }

    /// String view of a parameter; numbers and booleans are rendered.
    pub fn param_str(&self, key: &str) -> Option<String> {
        self.parameters.get(key).and_then(value_to_string)
    }

    /// Integer view of a parameter; accepts JSON numbers and numeric strings.
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        match self.parameters.get(key)? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// One-line description of the request for logs and the audit trail.
    pub fn summary(&self) -> String {
        if let Some(command) = self.param_str("command") {
            return command;
        }
        let mut keys: Vec<&String> = self.parameters.keys().collect();
        keys.sort();
        let parts: Vec<String> = keys
            .iter()
            .take(3)
            .map(|k| {
                let v = self.param_str(k).unwrap_or_default();
                let truncated: String = v.chars().take(60).collect();
                format!("{k}={truncated}")
            })
            .collect();
        parts.join(", ")
    }
}

pub(crate) fn value_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// The normalized result handed back to the agent for every invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub payload: String,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(payload: impl Into<String>) -> Self {
        Self {
            success: true,
            payload: payload.into(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn failure_with_payload(error: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: payload.into(),
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_names_parse_and_render() {
        for name in ToolName::known() {
            assert_eq!(ToolName::parse(name.as_str()), name);
        }
        assert_eq!(
            ToolName::parse("run_commnd"),
            ToolName::Unknown("run_commnd".to_string())
        );
    }

    #[test]
    fn tool_name_serializes_as_plain_string() {
        let json = serde_json::to_string(&ToolName::MailboxSend).unwrap();
        assert_eq!(json, "\"mailbox_send\"");
        let back: ToolName = serde_json::from_str("\"shell\"").unwrap();
        assert_eq!(back, ToolName::Unknown("shell".to_string()));
    }

    #[test]
    fn every_known_tool_has_a_spec() {
        for name in ToolName::known() {
            let spec = name.spec().unwrap();
            assert_eq!(spec.name, name.as_str());
        }
        assert!(ToolName::Unknown("x".into()).spec().is_none());
    }

    #[test]
    fn openai_schema_lists_required_params_and_typed_defaults() {
        let tools = openai_tools();
        let arr = tools.as_array().unwrap();
        assert_eq!(arr.len(), 4);

        let run = &arr[0]["function"];
        assert_eq!(run["name"], "run_command");
        assert_eq!(run["parameters"]["required"], serde_json::json!(["command"]));
        assert_eq!(run["parameters"]["properties"]["timeout_secs"]["type"], "integer");

        let read = &arr[1]["function"]["parameters"]["properties"];
        assert_eq!(read["max_results"]["default"], 10);
        assert_eq!(read["unread_only"]["default"], false);
    }

    #[test]
    fn from_tool_call_copies_object_arguments() {
        let inv = ToolInvocation::from_tool_call(
            "call_1",
            "run_command",
            &serde_json::json!({"command": "uptime", "timeout_secs": 5}),
            "turn-7",
        );
        assert_eq!(inv.invocation_id.as_str(), "call_1");
        assert_eq!(inv.tool_name, ToolName::RunCommand);
        assert_eq!(inv.param_str("command").as_deref(), Some("uptime"));
        assert_eq!(inv.param_u64("timeout_secs"), Some(5));
        assert_eq!(inv.requested_by, "turn-7");

        let inv = ToolInvocation::from_tool_call("c", "today_date", &serde_json::json!("junk"), "t");
        assert!(inv.parameters.is_empty());
    }

    #[test]
    fn param_views_handle_types() {
        let inv = ToolInvocation::new(InvocationId::new("x"), ToolName::MailboxRead)
            .with_param("max_results", serde_json::json!("7"))
            .with_param("unread_only", serde_json::json!(true))
            .with_param("query", serde_json::Value::Null);
        assert_eq!(inv.param_u64("max_results"), Some(7));
        assert_eq!(inv.param_str("unread_only").as_deref(), Some("true"));
        assert_eq!(inv.param_str("query"), None);
        assert_eq!(inv.param_u64("unread_only"), None);
    }

    #[test]
    fn summary_prefers_command_text() {
        let inv = ToolInvocation::run_command(InvocationId::new("a"), "df -h");
        assert_eq!(inv.summary(), "df -h");

        let inv = ToolInvocation::new(InvocationId::new("b"), ToolName::MailboxSend)
            .with_param("to", serde_json::json!("ops@example.com"))
            .with_param("subject", serde_json::json!("disk"));
        assert_eq!(inv.summary(), "subject=disk, to=ops@example.com");
    }

    #[test]
    fn invocation_deserializes_with_defaults() {
        let inv: ToolInvocation = serde_json::from_str(
            r#"{"invocation_id": "call-9", "tool_name": "run_command", "parameters": {"command": "id"}}"#,
        )
        .unwrap();
        assert_eq!(inv.tool_name, ToolName::RunCommand);
        assert!(inv.requested_by.is_empty());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(InvocationId::generate(), InvocationId::generate());
    }
}
