use async_trait::async_trait;
use serde_json::{json, Value};

use nodes::ModelConfig;

use crate::dispatch::NodeExecutor;
use crate::error::EngineError;
use crate::models::{NodeConfig, NodeKind, NodeType};
use crate::runtime::NodeCx;
use crate::template;

/// Single-shot generation.
///
/// Output: `{"text": .., "tokens": n}`, plus `"json"` when the reply parses
/// as a JSON object or array.
#[derive(Debug, Default, Clone, Copy)]
pub struct LlmExecutor;

#[async_trait]
impl NodeExecutor for LlmExecutor {
    async fn execute(&self, node: &NodeConfig, cx: &NodeCx) -> Result<Value, EngineError> {
        let NodeKind::Llm(spec) = &node.kind else {
            return Err(super::mismatch(node, NodeType::Llm));
        };
        let prompt = template::resolve_text(&spec.prompt, cx.snapshot(), &node.id)?;
        cx.check_input(&Value::String(prompt.clone()))?;
        let system_prompt = spec
            .system_prompt
            .as_deref()
            .map(|s| template::resolve_text(s, cx.snapshot(), &node.id))
            .transpose()?;

        let config = ModelConfig {
            model: spec.model.clone(),
            temperature: spec.temperature,
            max_tokens: spec.max_tokens,
            system_prompt,
            tools: Vec::new(),
        };
        let generation = cx.generate(&prompt, &config, &cx.retry_policy()).await?;

        let mut output = json!({
            "text": generation.text,
            "tokens": generation.usage.total(),
        });
        let parsed = serde_json::from_str::<Value>(generation.text.trim());
        if let Ok(parsed @ (Value::Object(_) | Value::Array(_))) = parsed {
            output["json"] = parsed;
        }
        Ok(output)
    }
}
