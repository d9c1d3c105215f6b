//! Agent-facing tool surface over the Kestrel process runtime.
//!
//! Tools take JSON arguments and return a JSON payload plus an error flag so
//! an agent loop can feed the result back as a tool message.

mod command_runner_tool;
mod tool_arguments;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use command_runner_tool::{CommandRunnerAction, CommandRunnerTool, COMMAND_RUNNER_TOOL_NAME};

/// Name, description and JSON schema advertised for a tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecutionResult {
    pub content: Value,
    pub is_error: bool,
}

impl ToolExecutionResult {
    /// Creates a successful tool result.
    pub fn ok(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    /// Creates a failed tool result.
    pub fn error(content: Value) -> Self {
        Self {
            content,
            is_error: true,
        }
    }

    /// Converts the payload to text for insertion into a tool message.
    pub fn as_text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        }
    }
}

#[async_trait]
pub trait AgentTool: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    fn is_cacheable(&self) -> bool {
        false
    }
    async fn execute(&self, arguments: Value) -> ToolExecutionResult;
}
