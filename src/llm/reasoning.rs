//! LLM reasoning for the plan and think phases.
//!
//! Both phases ask for JSON. Models often wrap it in prose, code fences or
//! `<thinking>` blocks, so parsing is lenient, and a reply that still cannot
//! be parsed degrades to "no decision" rather than an error.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::agent::ActionRecord;
use crate::bridge::AvailableTool;
use crate::error::LlmError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};

/// Inputs to one think call.
#[derive(Debug, Clone, Copy)]
pub struct ThinkContext<'a> {
    pub goal: &'a str,
    pub plan: &'a [String],
    pub tools: &'a [AvailableTool],
    /// Most recent executed actions, oldest first.
    pub actions: &'a [ActionRecord],
    /// Most recent observations, oldest first.
    pub observations: &'a [String],
    pub iteration: u32,
    pub max_iterations: u32,
}

/// A tool call proposed by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolIntent {
    pub server_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub reasoning: String,
}

/// What the model decided to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum ThinkDecision {
    /// The goal is reached.
    Complete { answer: String, reasoning: String },
    /// Run one tool.
    Act(ToolIntent),
    /// Not complete and nothing to run; think again next iteration.
    Idle { reasoning: String },
}

/// Reasoning engine for the agent loop.
pub struct Reasoning {
    llm: Arc<dyn LlmProvider>,
}

impl Reasoning {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    /// Break a goal into ordered sub-steps.
    ///
    /// Fails if the provider fails or the reply holds no usable steps; the
    /// caller falls back to a generic plan.
    pub async fn plan(&self, goal: &str, tools: &[AvailableTool]) -> Result<Vec<String>, LlmError> {
        let messages = vec![
            ChatMessage::system(build_planning_prompt(tools)),
            ChatMessage::user(format!("Create a plan for this goal:\n\n{}", goal)),
        ];

        let request = CompletionRequest::new(messages)
            .with_max_tokens(1024)
            .with_temperature(0.3)
            .with_json_output();

        let response = self.llm.complete(request).await?;
        let steps = parse_plan(&response.content);
        if steps.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason: "Plan contained no steps".to_string(),
            });
        }
        Ok(steps)
    }

    /// Decide the next move.
    ///
    /// Only provider failures are errors. An unparseable reply is
    /// [`ThinkDecision::Idle`].
    pub async fn think(&self, ctx: &ThinkContext<'_>) -> Result<ThinkDecision, LlmError> {
        let messages = vec![
            ChatMessage::system(build_think_prompt(ctx.tools)),
            ChatMessage::user(build_think_input(ctx)),
        ];

        let request = CompletionRequest::new(messages)
            .with_max_tokens(1024)
            .with_temperature(0.2)
            .with_json_output();

        let response = self.llm.complete(request).await?;
        Ok(parse_think(&response.content, ctx.tools))
    }
}

fn build_planning_prompt(tools: &[AvailableTool]) -> String {
    format!(
        r#"You are a planning assistant for an autonomous agent. Break the user's goal into a short, ordered list of concrete steps.

Available tools:
{}

Respond with JSON only:
{{
    "steps": ["first step", "second step"]
}}"#,
        describe_tools(tools)
    )
}

fn build_think_prompt(tools: &[AvailableTool]) -> String {
    format!(
        r#"You are the reasoning core of an autonomous agent working toward a goal one tool call at a time.

Available tools:
{}

Look at the goal, the plan, the actions taken so far and what was observed. Then either declare the goal complete or choose exactly one tool call.

If the goal is complete, respond with:
{{"complete": true, "answer": "final answer for the user", "reasoning": "why it is done"}}

Otherwise respond with:
{{"complete": false, "reasoning": "why this action", "action": {{"server_id": "server", "tool": "tool_name", "arguments": {{}}}}}}

Respond with JSON only."#,
        describe_tools(tools)
    )
}

fn describe_tools(tools: &[AvailableTool]) -> String {
    if tools.is_empty() {
        return "No tools available.".to_string();
    }
    tools
        .iter()
        .map(|t| {
            format!(
                "- {} (server: {}): {}\n  input schema: {}",
                t.tool.name, t.server_id, t.tool.description, t.tool.input_schema
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_think_input(ctx: &ThinkContext<'_>) -> String {
    let mut out = format!(
        "Goal: {}\n\nIteration {} of {}.\n",
        ctx.goal, ctx.iteration, ctx.max_iterations
    );

    if !ctx.plan.is_empty() {
        out.push_str("\nPlan:\n");
        for (i, step) in ctx.plan.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, step));
        }
    }

    if !ctx.actions.is_empty() {
        out.push_str("\nActions taken:\n");
        for action in ctx.actions {
            let outcome = match (&action.error, &action.result) {
                (Some(err), _) => format!("failed: {}", err),
                (None, Some(result)) => format!("ok: {}", truncate(&result.to_string(), 500)),
                (None, None) => "skipped".to_string(),
            };
            out.push_str(&format!(
                "- {}.{}({}) -> {}\n",
                action.server_id, action.tool_name, action.arguments, outcome
            ));
        }
    }

    if !ctx.observations.is_empty() {
        out.push_str("\nObservations:\n");
        for observation in ctx.observations {
            out.push_str(&format!("- {}\n", observation));
        }
    }

    out
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlanItem {
    Text(String),
    Detailed {
        #[serde(alias = "step", alias = "action")]
        description: String,
    },
}

impl PlanItem {
    fn into_text(self) -> String {
        match self {
            PlanItem::Text(s) | PlanItem::Detailed { description: s } => s,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlanResponse {
    Object {
        #[serde(alias = "plan")]
        steps: Vec<PlanItem>,
    },
    List(Vec<PlanItem>),
}

fn parse_plan(content: &str) -> Vec<String> {
    let cleaned = strip_thinking_tags(content);
    let Some(json) = extract_json(&cleaned) else {
        return Vec::new();
    };

    let items = match serde_json::from_str::<PlanResponse>(json) {
        Ok(PlanResponse::Object { steps }) | Ok(PlanResponse::List(steps)) => steps,
        Err(e) => {
            tracing::debug!("Failed to parse plan: {}", e);
            return Vec::new();
        }
    };

    items
        .into_iter()
        .map(|item| item.into_text().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Deserialize)]
struct ThinkResponse {
    #[serde(default, alias = "done", alias = "is_complete")]
    complete: bool,
    #[serde(default, alias = "final_answer", alias = "result")]
    answer: Option<String>,
    #[serde(default, alias = "thought")]
    reasoning: String,
    #[serde(default)]
    action: Option<ActionResponse>,
}

#[derive(Deserialize)]
struct ActionResponse {
    #[serde(default, alias = "serverId", alias = "server")]
    server_id: Option<String>,
    #[serde(alias = "tool_name", alias = "toolName", alias = "name")]
    tool: String,
    #[serde(default, alias = "args", alias = "parameters")]
    arguments: Value,
}

fn parse_think(content: &str, tools: &[AvailableTool]) -> ThinkDecision {
    let cleaned = strip_thinking_tags(content);
    let parsed = extract_json(&cleaned)
        .ok_or_else(|| "no JSON object in reply".to_string())
        .and_then(|json| serde_json::from_str::<ThinkResponse>(json).map_err(|e| e.to_string()));

    let response = match parsed {
        Ok(r) => r,
        Err(reason) => {
            tracing::debug!("Unparseable think reply: {}", reason);
            return ThinkDecision::Idle {
                reasoning: format!("Could not parse reasoning output: {}", reason),
            };
        }
    };

    if response.complete {
        return ThinkDecision::Complete {
            answer: response.answer.unwrap_or_default(),
            reasoning: response.reasoning,
        };
    }

    let Some(action) = response.action else {
        return ThinkDecision::Idle {
            reasoning: response.reasoning,
        };
    };

    let server_id = match action.server_id.filter(|s| !s.is_empty()) {
        Some(id) => id,
        None => match tools.iter().find(|t| t.tool.name == action.tool) {
            Some(t) => t.server_id.clone(),
            None => {
                return ThinkDecision::Idle {
                    reasoning: format!("Proposed unknown tool '{}'", action.tool),
                };
            }
        },
    };

    let arguments = match action.arguments {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };

    ThinkDecision::Act(ToolIntent {
        server_id,
        tool_name: action.tool,
        arguments,
        reasoning: response.reasoning,
    })
}

static JSON_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```")
        .unwrap_or_else(|e| panic!("fence pattern is invalid: {e}"))
});

/// Extract JSON from text that might contain other content.
fn extract_json(text: &str) -> Option<&str> {
    if let Some(inner) = JSON_FENCE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|s| s.starts_with('{') || s.starts_with('['))
    {
        return Some(inner);
    }

    // Find the first opener and matching last closer
    let start = text.find(['{', '['])?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    if start < end {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Strip `<thinking>...</thinking>` blocks from LLM output.
fn strip_thinking_tags(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut remaining = text;

    while let Some(start) = remaining.find("<thinking>") {
        result.push_str(&remaining[..start]);

        if let Some(end_offset) = remaining[start..].find("</thinking>") {
            let end = start + end_offset + "</thinking>".len();
            remaining = &remaining[end..];
        } else {
            // Unclosed tag: drop the rest
            remaining = "";
            break;
        }
    }

    result.push_str(remaining);
    result.trim().to_string()
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
