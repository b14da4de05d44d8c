use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::dispatch::NodeExecutor;
use crate::error::EngineError;
use crate::executor::execute_run;
use crate::models::{NodeConfig, NodeKind, NodeStatus, NodeType};
use crate::runtime::NodeCx;
use crate::template;

/// Runs a nested blueprint as its own run.
///
/// The nested run gets a fresh id and context but shares the parent's
/// worker slots, event sink and cancellation; its usage counts against the
/// parent budget. Resolved `inputs` are merged over the nested blueprint's
/// own inputs.
///
/// Output: `{"run_id", "outputs": {id: output}, "total_tokens", "total_cost"}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubWorkflowExecutor;

#[async_trait]
impl NodeExecutor for SubWorkflowExecutor {
    async fn execute(&self, node: &NodeConfig, cx: &NodeCx) -> Result<Value, EngineError> {
        let NodeKind::Workflow(spec) = &node.kind else {
            return Err(super::mismatch(node, NodeType::Workflow));
        };
        let plan = cx
            .plan()
            .nested(&node.id)
            .cloned()
            .ok_or_else(|| EngineError::invalid(&node.id, "nested blueprint was not planned"))?;

        let overrides = template::resolve_value(&spec.inputs, cx.snapshot(), &node.id)?;
        cx.check_input(&overrides)?;
        let mut inputs = plan.inputs().clone();
        match overrides {
            Value::Object(map) => inputs.extend(map),
            Value::Null => {}
            other => {
                return Err(EngineError::fatal(
                    &node.id,
                    format!(
                        "workflow inputs must be an object, found {}",
                        template::type_name(&other)
                    ),
                ))
            }
        }

        let name = plan.name().to_owned();
        let completed =
            execute_run(cx.scope.nested(Arc::clone(&plan)), Value::Object(inputs)).await;
        if let Some(err) = completed.abort {
            return Err(err);
        }
        let result = completed.result;
        cx.absorb_usage(result.total_tokens, result.total_cost, result.metrics.calls);

        if !result.success {
            let reason = result
                .error
                .as_ref()
                .map(|e| match &e.node_id {
                    Some(id) => format!("'{id}': {}", e.message),
                    None => e.message.clone(),
                })
                .unwrap_or_else(|| "unknown failure".to_owned());
            return Err(EngineError::fatal(
                &node.id,
                format!("nested workflow '{name}' failed at {reason}"),
            ));
        }

        let outputs: Map<String, Value> = result
            .node_results
            .iter()
            .filter(|(_, r)| r.status == NodeStatus::Succeeded)
            .map(|(id, r)| (id.clone(), r.output.clone()))
            .collect();
        Ok(json!({
            "run_id": result.run_id,
            "outputs": outputs,
            "total_tokens": result.total_tokens,
            "total_cost": result.total_cost,
        }))
    }
}
