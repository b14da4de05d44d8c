use async_trait::async_trait;
use serde_json::Value;

use crate::dispatch::NodeExecutor;
use crate::error::EngineError;
use crate::models::{NodeConfig, NodeKind, NodeType};
use crate::runtime::NodeCx;
use crate::template;

/// Resolves the argument template and calls the named tool.
#[derive(Debug, Default, Clone, Copy)]
pub struct ToolExecutor;

#[async_trait]
impl NodeExecutor for ToolExecutor {
    async fn execute(&self, node: &NodeConfig, cx: &NodeCx) -> Result<Value, EngineError> {
        let NodeKind::Tool(spec) = &node.kind else {
            return Err(super::mismatch(node, NodeType::Tool));
        };
        let args = template::resolve_value(&spec.args, cx.snapshot(), &node.id)?;
        cx.check_input(&args)?;
        cx.call_tool(&spec.tool_name, args, &cx.retry_policy()).await
    }
}
