use async_trait::async_trait;
use serde_json::Value;

use crate::dispatch::NodeExecutor;
use crate::error::EngineError;
use crate::models::{NodeConfig, NodeKind, NodeType};
use crate::runtime::NodeCx;
use crate::template;

/// Runs user code in the sandbox. The sandbox's return value is the output.
#[derive(Debug, Default, Clone, Copy)]
pub struct CodeExecutor;

#[async_trait]
impl NodeExecutor for CodeExecutor {
    async fn execute(&self, node: &NodeConfig, cx: &NodeCx) -> Result<Value, EngineError> {
        let NodeKind::Code(spec) = &node.kind else {
            return Err(super::mismatch(node, NodeType::Code));
        };
        let inputs = template::resolve_value(&spec.inputs, cx.snapshot(), &node.id)?;
        cx.check_input(&inputs)?;
        cx.run_sandboxed(&spec.code, inputs, &spec.allowed_imports, &cx.retry_policy())
            .await
    }
}
