//! Wire format for the tool-execution bridge.
//!
//! Every frame is a JSON object tagged with `type`. Requests carry a
//! caller-generated `requestId` (the auth handshake uses `id`), and the
//! peer echoes it on the matching response.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Message type tags.
pub mod kind {
    pub const AUTH: &str = "auth";
    pub const RESPONSE: &str = "response";
    pub const ERROR: &str = "error";
    pub const DISCOVER: &str = "discover";
    pub const SERVERS: &str = "servers";
    pub const LIST_TOOLS: &str = "list_tools";
    pub const TOOLS_LIST: &str = "tools_list";
    pub const TOOLS_ERROR: &str = "tools_error";
    pub const CALL_TOOL: &str = "call_tool";
    pub const TOOL_RESULT: &str = "tool_result";
    pub const TOOL_ERROR: &str = "tool_error";
    /// Handler key that receives every inbound message.
    pub const WILDCARD: &str = "*";
}

/// Lifecycle status of a peer-side server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Available,
    Running,
    Stopped,
    Error,
    #[default]
    Detected,
}

/// A tool server hosted by the peer. Read-only snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeServer {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub status: ServerStatus,
}

impl BridgeServer {
    /// Whether tools can be listed and called on this server.
    pub fn is_usable(&self) -> bool {
        matches!(
            self.status,
            ServerStatus::Available | ServerStatus::Running | ServerStatus::Detected
        )
    }
}

/// A tool exposed by a peer-side server. Read-only snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// An inbound frame, kept as raw JSON with typed accessors.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeMessage(Value);

impl BridgeMessage {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        Ok(Self(value))
    }

    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    /// The `type` tag, or empty if missing.
    pub fn kind(&self) -> &str {
        self.0.get("type").and_then(Value::as_str).unwrap_or("")
    }

    /// The correlation id: `requestId` if present, otherwise `id`.
    pub fn correlation_id(&self) -> Option<String> {
        ["requestId", "id"]
            .iter()
            .filter_map(|key| self.0.get(*key))
            .find_map(id_to_string)
    }

    /// Response body: `data` if present, else `payload`.
    pub fn body(&self) -> Option<&Value> {
        self.0.get("data").or_else(|| self.0.get("payload"))
    }

    /// Error text from `error` (string or object with `message`).
    pub fn error_message(&self) -> Option<String> {
        let err = self.0.get("error")?;
        Some(match err {
            Value::String(s) => s.clone(),
            other => other
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        })
    }

    /// Whether this frame reports a failure.
    pub fn is_error(&self) -> bool {
        matches!(
            self.kind(),
            kind::ERROR | kind::TOOL_ERROR | kind::TOOLS_ERROR
        )
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Outbound `auth` frame.
pub fn auth(id: &str, secret: &str) -> Value {
    json!({ "id": id, "type": kind::AUTH, "payload": { "secret": secret } })
}

/// Outbound `discover` frame.
pub fn discover(request_id: &str) -> Value {
    json!({ "type": kind::DISCOVER, "requestId": request_id })
}

/// Outbound `list_tools` frame.
pub fn list_tools(request_id: &str, server_id: &str) -> Value {
    json!({ "type": kind::LIST_TOOLS, "requestId": request_id, "serverId": server_id })
}

/// Outbound `call_tool` frame.
pub fn call_tool(request_id: &str, server_id: &str, tool_name: &str, arguments: &Value) -> Value {
    json!({
        "type": kind::CALL_TOOL,
        "requestId": request_id,
        "serverId": server_id,
        "toolName": tool_name,
        "arguments": arguments,
    })
}

/// Outcome of the auth handshake carried by a `response` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResult {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}
