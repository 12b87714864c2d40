//! Test doubles shared by unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::agent::ConfirmationCallback;
use crate::bridge::{BridgeError, BridgeServer, BridgeTool, ServerStatus, ToolBridge};
use crate::error::LlmError;
use crate::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use crate::safety::ConfirmationTicket;

/// Replies with queued completions, then a fixed fallback.
pub(crate) struct ScriptedLlm {
    replies: Mutex<VecDeque<String>>,
    fallback: Option<String>,
}

impl ScriptedLlm {
    pub(crate) fn new<'a>(replies: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(str::to_string).collect()),
            fallback: None,
        }
    }

    pub(crate) fn with_fallback(mut self, reply: &str) -> Self {
        self.fallback = Some(reply.to_string());
        self
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let next = self.replies.lock().unwrap().pop_front();
        let content = next.or_else(|| self.fallback.clone()).ok_or_else(|| {
            LlmError::RequestFailed {
                provider: "scripted".to_string(),
                reason: "script exhausted".to_string(),
            }
        })?;
        Ok(CompletionResponse {
            content,
            finish_reason: FinishReason::Stop,
            input_tokens: 0,
            output_tokens: 0,
        })
    }
}

/// In-process bridge that records calls.
pub(crate) struct MockBridge {
    tools: HashMap<String, Vec<BridgeTool>>,
    failure: Option<BridgeError>,
    calls: Mutex<Vec<(String, String, Value)>>,
}

impl MockBridge {
    pub(crate) fn new() -> Self {
        Self {
            tools: HashMap::new(),
            failure: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_tool(mut self, server_id: &str, name: &str) -> Self {
        self.tools
            .entry(server_id.to_string())
            .or_default()
            .push(BridgeTool {
                name: name.to_string(),
                description: format!("{name} tool"),
                input_schema: json!({"type": "object"}),
            });
        self
    }

    pub(crate) fn failing_with(mut self, error: BridgeError) -> Self {
        self.failure = Some(error);
        self
    }

    pub(crate) fn calls(&self) -> Vec<(String, String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolBridge for MockBridge {
    async fn discover(&self) -> Result<Vec<BridgeServer>, BridgeError> {
        Ok(self
            .tools
            .keys()
            .map(|id| BridgeServer {
                id: id.clone(),
                name: id.clone(),
                command: String::new(),
                args: Vec::new(),
                env: HashMap::new(),
                status: ServerStatus::Running,
            })
            .collect())
    }

    async fn list_tools(&self, server_id: &str) -> Result<Vec<BridgeTool>, BridgeError> {
        Ok(self.tools.get(server_id).cloned().unwrap_or_default())
    }

    async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Value, BridgeError> {
        self.calls.lock().unwrap().push((
            server_id.to_string(),
            tool_name.to_string(),
            arguments.clone(),
        ));
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(json!({ "ok": true, "tool": tool_name, "arguments": arguments })),
        }
    }
}

/// Approves only the named tools.
pub(crate) struct StaticCallback {
    approved: HashSet<String>,
}

impl StaticCallback {
    pub(crate) fn approving<'a>(tools: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            approved: tools.into_iter().map(str::to_string).collect(),
        }
    }
}

#[async_trait]
impl ConfirmationCallback for StaticCallback {
    async fn confirm(&self, ticket: &ConfirmationTicket) -> bool {
        self.approved.contains(&ticket.tool_name)
    }
}
