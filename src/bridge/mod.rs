//! Bridge to the remote tool-execution peer.
//!
//! The peer hosts tool servers and runs tools on the agent's behalf. The
//! client keeps one authenticated WebSocket open, multiplexes concurrent
//! requests over it, and reconnects with backoff when it drops.

mod client;
mod error;
pub mod protocol;

pub use client::{BridgeClient, BridgeConfig, ConnectionState, Handler, HandlerId};
pub use error::BridgeError;
pub use protocol::{BridgeMessage, BridgeServer, BridgeTool, ServerStatus};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool together with the server that hosts it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableTool {
    pub server_id: String,
    pub tool: BridgeTool,
}

/// Tool execution as seen by the agent engine.
#[async_trait]
pub trait ToolBridge: Send + Sync {
    /// List the peer's tool servers.
    async fn discover(&self) -> Result<Vec<BridgeServer>, BridgeError>;

    /// List the tools one server exposes.
    async fn list_tools(&self, server_id: &str) -> Result<Vec<BridgeTool>, BridgeError>;

    /// Run a tool and return its result payload.
    async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Value, BridgeError>;
}

/// Fetch every tool from every usable server.
///
/// A server whose listing fails is skipped with a warning.
pub async fn collect_tools(bridge: &dyn ToolBridge) -> Result<Vec<AvailableTool>, BridgeError> {
    let servers = bridge.discover().await?;
    let mut tools = Vec::new();

    for server in servers.iter().filter(|s| s.is_usable()) {
        match bridge.list_tools(&server.id).await {
            Ok(listed) => tools.extend(listed.into_iter().map(|tool| AvailableTool {
                server_id: server.id.clone(),
                tool,
            })),
            Err(e) => {
                tracing::warn!(server_id = %server.id, "Failed to list tools: {}", e);
            }
        }
    }

    Ok(tools)
}
