//! The collaborator traits: what the engine needs from the outside world.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::NodeError;

/// Context passed to every tool invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// ID of the workflow run that owns the call.
    pub run_id: uuid::Uuid,
    /// Node on whose behalf the tool is running (tool node or agent node).
    pub node_id: String,
    /// 1-based attempt number; greater than 1 on retries.
    pub attempt: u32,
}

/// A named, pre-registered deterministic operation.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name used by blueprints (`tool_name`) and by agents (tool calls).
    fn name(&self) -> &str;

    /// Human-readable description offered to models.
    fn description(&self) -> &str {
        ""
    }

    /// Run the tool with already-resolved arguments.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, NodeError>;
}

/// Token accounting reported by a model provider for one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Provider-reported cost. When absent the engine prices the call itself.
    #[serde(default)]
    pub cost: Option<f64>,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            cost: None,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A tool invocation requested by a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// The outcome of one `generate` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub text: String,
    pub usage: TokenUsage,
    /// Tool calls requested by the model. Empty means the model is done.
    pub tool_calls: Vec<ToolCall>,
}

impl Generation {
    /// A plain text completion.
    pub fn text(text: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            text: text.into(),
            usage,
            tool_calls: Vec::new(),
        }
    }

    /// A completion that asks for a single tool call.
    pub fn tool_call(name: impl Into<String>, arguments: Value, usage: TokenUsage) -> Self {
        Self {
            text: String::new(),
            usage,
            tool_calls: vec![ToolCall {
                name: name.into(),
                arguments,
            }],
        }
    }
}

/// Description of a tool offered to the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Per-call model settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Tools the model may call. Empty for plain completions.
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
}

/// The model-provider contract: `generate(prompt, config) -> (text, usage) | error`.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn generate(&self, prompt: &str, config: &ModelConfig) -> Result<Generation, NodeError>;
}

/// The sandboxed-execution contract for untrusted user code.
///
/// Implementations must return [`NodeError::SandboxViolation`] when the code
/// tries to import a module outside `allowed_imports`.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn run_sandboxed(
        &self,
        code: &str,
        inputs: Value,
        allowed_imports: &[String],
    ) -> Result<Value, NodeError>;
}
