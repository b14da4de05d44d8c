use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::agent::{run_agent, CallStack};
use crate::dispatch::NodeExecutor;
use crate::error::EngineError;
use crate::expression;
use crate::models::{NodeConfig, NodeKind, NodeType};
use crate::runtime::NodeCx;
use crate::template;

/// Runs one agent to completion.
///
/// Output: `{"agent_id", "answer", "steps", "tool_calls": [names]}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AgentExecutor;

#[async_trait]
impl NodeExecutor for AgentExecutor {
    async fn execute(&self, node: &NodeConfig, cx: &NodeCx) -> Result<Value, EngineError> {
        let NodeKind::Agent(agent) = &node.kind else {
            return Err(super::mismatch(node, NodeType::Agent));
        };
        let task = template::resolve_text(&agent.prompt, cx.snapshot(), &node.id)?;
        cx.check_input(&Value::String(task.clone()))?;
        let agent_id = agent.agent_id.as_deref().unwrap_or(&node.id);
        let outcome = run_agent(cx, agent, agent_id, task, CallStack::new()).await?;
        Ok(outcome.to_value())
    }
}

/// Rounds of agents taking turns on a shared transcript.
///
/// Every round each participant speaks once, in order. Participant prompts
/// and `until` see `round`, `last` (the latest answer) and `transcript`.
/// The node stops when `until` holds after a round, or after `max_rounds`.
///
/// Output: `{"rounds", "converged", "last", "transcript": [{round, speaker, text}]}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecursiveExecutor;

fn round_locals(round: u32, last: &str, transcript: &[Value]) -> Map<String, Value> {
    let mut locals = Map::new();
    locals.insert("round".to_owned(), json!(round));
    locals.insert("last".to_owned(), json!(last));
    locals.insert("transcript".to_owned(), Value::Array(transcript.to_vec()));
    locals
}

#[async_trait]
impl NodeExecutor for RecursiveExecutor {
    async fn execute(&self, node: &NodeConfig, cx: &NodeCx) -> Result<Value, EngineError> {
        let NodeKind::Recursive(spec) = &node.kind else {
            return Err(super::mismatch(node, NodeType::Recursive));
        };
        let max_rounds = match spec.max_rounds {
            Some(rounds) if rounds > 0 => rounds,
            _ => {
                return Err(EngineError::RecursionLimit {
                    node_id: node.id.clone(),
                    message: "max_rounds must be set to a positive number".into(),
                })
            }
        };
        let topic = template::resolve_text(&spec.prompt, cx.snapshot(), &node.id)?;
        cx.check_input(&Value::String(topic.clone()))?;

        let mut transcript: Vec<Value> = Vec::new();
        let mut last = String::new();
        let mut rounds = 0;
        let mut converged = false;

        for round in 1..=max_rounds {
            rounds = round;
            for (i, participant) in spec.participants.iter().enumerate() {
                let view = cx.snapshot().with_locals(round_locals(round, &last, &transcript));
                let instructions = template::resolve_text(&participant.prompt, &view, &node.id)?;
                let speaker = participant
                    .agent_id
                    .clone()
                    .unwrap_or_else(|| format!("{}#{i}", node.id));

                let mut task = format!("{instructions}\n\nTopic: {topic}");
                if !transcript.is_empty() {
                    let lines: Vec<String> = transcript
                        .iter()
                        .map(|t| {
                            let speaker = t["speaker"].as_str().unwrap_or("?");
                            format!("{speaker}: {}", t["text"].as_str().unwrap_or(""))
                        })
                        .collect();
                    task.push_str("\n\nSo far:\n");
                    task.push_str(&lines.join("\n"));
                }

                let outcome = run_agent(cx, participant, &speaker, task, CallStack::new()).await?;
                last = outcome.answer;
                transcript.push(json!({"round": round, "speaker": speaker, "text": last.clone()}));
            }

            if let Some(until) = &spec.until {
                let view = cx.snapshot().with_locals(round_locals(round, &last, &transcript));
                if expression::evaluate_bool(until, &view, &node.id)? {
                    converged = true;
                    break;
                }
            }
        }
        debug!(node_id = %node.id, rounds, converged, "recursive node finished");

        Ok(json!({
            "rounds": rounds,
            "converged": converged,
            "last": last,
            "transcript": transcript,
        }))
    }
}
