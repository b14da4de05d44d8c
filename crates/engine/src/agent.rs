//! The agent loop: prompt the model, run the tools it asks for, feed the
//! observations back, stop when it answers without tool calls.
//!
//! Rules:
//!   1. Every agent runs under a step cap; exhausting it is `AgentStepLimit`.
//!   2. An agent may call another agent of the same plan as a tool. The call
//!      stack of agent ids is carried along, and re-entering an agent already
//!      on it is `AgentCycle`, raised before any model call.
//!   3. Tool failures that are not fatal to the run become observations so
//!      the model can recover from them.
//!   4. With a memory domain configured, long-term memory seeds the first
//!      step, observations land in the run's working memory, and the outcome
//!      is written back as an episode and a procedure result.

use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use memory::{Entity, Episode, MemoryRecord};
use nodes::{ModelConfig, ToolCall, ToolSpec};

use crate::error::EngineError;
use crate::models::{AgentMemory, AgentNode};
use crate::plan::{RECALL_TOOL, REMEMBER_TOOL};
use crate::runtime::NodeCx;
use crate::template;

/// Agent ids currently executing, outermost first.
pub type CallStack = Vec<String>;

#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutcome {
    pub agent_id: String,
    pub answer: String,
    pub steps: u32,
    pub tool_calls: Vec<String>,
}

impl AgentOutcome {
    pub fn to_value(&self) -> Value {
        json!({
            "agent_id": self.agent_id,
            "answer": self.answer,
            "steps": self.steps,
            "tool_calls": self.tool_calls,
        })
    }
}

pub fn run_agent<'a>(
    cx: &'a NodeCx,
    agent: &'a AgentNode,
    agent_id: &'a str,
    task: String,
    stack: CallStack,
) -> BoxFuture<'a, Result<AgentOutcome, EngineError>> {
    async move {
        if stack.iter().any(|id| id == agent_id) {
            let mut cycle = stack;
            cycle.push(agent_id.to_owned());
            return Err(EngineError::AgentCycle {
                agent_id: agent_id.to_owned(),
                stack: cycle,
            });
        }
        let max_steps = match agent.max_steps {
            Some(steps) if steps > 0 => steps,
            _ => {
                return Err(EngineError::RecursionLimit {
                    node_id: cx.node_id().to_owned(),
                    message: format!("agent '{agent_id}' has no step cap"),
                })
            }
        };
        let mut stack = stack;
        stack.push(agent_id.to_owned());

        let started = Instant::now();
        let working = cx.engine().memory().working(cx.run_id());
        let session = agent
            .memory
            .as_ref()
            .map(|m| m.session_id.clone().unwrap_or_else(|| cx.run_id().to_string()));
        let recalled = match (&agent.memory, &session) {
            (Some(config), Some(session)) => recall_long_term(cx, config, agent_id, session),
            _ => String::new(),
        };

        let system_prompt = agent
            .system_prompt
            .as_deref()
            .map(|s| template::resolve_text(s, cx.snapshot(), cx.node_id()))
            .transpose()?;
        let config = ModelConfig {
            model: agent.model.clone(),
            temperature: None,
            max_tokens: None,
            system_prompt,
            tools: offered_tools(cx, agent),
        };
        let mut policy = cx.retry_policy();
        policy.timeout = None;

        let mut scratchpad: Vec<String> = Vec::new();
        let mut used: Vec<String> = Vec::new();
        for step in 1..=max_steps {
            let notes = agent
                .memory
                .as_ref()
                .map(|m| working.domain(&m.domain))
                .unwrap_or_default();
            let prompt = compose_prompt(&task, &recalled, &notes, &scratchpad);
            let generation = cx.generate(&prompt, &config, &policy).await?;

            if generation.tool_calls.is_empty() {
                let outcome = AgentOutcome {
                    agent_id: agent_id.to_owned(),
                    answer: generation.text,
                    steps: step,
                    tool_calls: used,
                };
                debug!(agent_id, steps = step, "agent answered");
                if let (Some(config), Some(session)) = (&agent.memory, &session) {
                    let content = json!({"task": task, "answer": outcome.answer});
                    let elapsed = started.elapsed();
                    let calls = &outcome.tool_calls;
                    persist(cx, config, agent_id, session, content, calls, true, elapsed).await?;
                }
                return Ok(outcome);
            }

            for (n, call) in generation.tool_calls.iter().enumerate() {
                let observation = match invoke(cx, agent, agent_id, call, &stack).await {
                    Ok(value) => value,
                    Err(err) if err.is_fatal_to_run() => return Err(err),
                    Err(err) => {
                        warn!(agent_id, tool = %call.name, error = %err, "tool call failed");
                        json!({"error": err.to_string()})
                    }
                };
                scratchpad.push(format!(
                    "[{step}] {}({}) -> {}",
                    call.name,
                    call.arguments,
                    template::to_text(&observation)
                ));
                if let Some(config) = &agent.memory {
                    working.put(
                        &config.domain,
                        &format!("{agent_id}/{step}.{n}/{}", call.name),
                        observation,
                        None,
                    );
                }
                used.push(call.name.clone());
            }
        }

        if let (Some(config), Some(session)) = (&agent.memory, &session) {
            let content = json!({"task": task, "answer": null, "step_limit": max_steps});
            persist(cx, config, agent_id, session, content, &used, false, started.elapsed()).await?;
        }
        Err(EngineError::AgentStepLimit {
            node_id: cx.node_id().to_owned(),
            agent_id: agent_id.to_owned(),
            max_steps,
        })
    }
    .boxed()
}

async fn invoke(
    cx: &NodeCx,
    agent: &AgentNode,
    agent_id: &str,
    call: &ToolCall,
    stack: &CallStack,
) -> Result<Value, EngineError> {
    if !agent.tools.iter().any(|t| t == &call.name) {
        return Ok(json!({"error": format!("'{}' is not available to {agent_id}", call.name)}));
    }
    if call.name == REMEMBER_TOOL {
        return remember(cx, agent, &call.arguments).await;
    }
    if call.name == RECALL_TOOL {
        return Ok(recall(cx, agent, &call.arguments));
    }
    if let Some((_, target)) = cx.plan().agent(&call.name) {
        let task = call
            .arguments
            .get("prompt")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| template::to_text(&call.arguments));
        debug!(caller = agent_id, callee = %call.name, "delegating to agent");
        let outcome = run_agent(cx, target, &call.name, task, stack.clone()).await?;
        return Ok(outcome.to_value());
    }
    cx.call_tool(&call.name, call.arguments.clone(), &cx.retry_policy())
        .await
}

fn offered_tools(cx: &NodeCx, agent: &AgentNode) -> Vec<ToolSpec> {
    let registered = cx.engine().tools().specs(&agent.tools);
    agent
        .tools
        .iter()
        .filter_map(|name| {
            if let Some(spec) = registered.iter().find(|s| &s.name == name) {
                return Some(spec.clone());
            }
            let description = match name.as_str() {
                REMEMBER_TOOL => {
                    "Store a fact. Arguments: {\"name\", \"type\", \"attributes\"}".to_owned()
                }
                RECALL_TOOL => "List stored facts. Arguments: {\"type\"} (optional)".to_owned(),
                other if cx.plan().agent(other).is_some() => {
                    format!("Ask agent '{other}'. Arguments: {{\"prompt\"}}")
                }
                _ => return None,
            };
            Some(ToolSpec {
                name: name.clone(),
                description,
            })
        })
        .collect()
}

fn compose_prompt(
    task: &str,
    recalled: &str,
    notes: &[MemoryRecord],
    scratchpad: &[String],
) -> String {
    let mut prompt = String::new();
    if !recalled.is_empty() {
        prompt.push_str(recalled);
        prompt.push('\n');
    }
    if !notes.is_empty() {
        prompt.push_str("Working notes:\n");
        for note in notes {
            prompt.push_str(&format!("- {}: {}\n", note.key, template::to_text(&note.value)));
        }
        prompt.push('\n');
    }
    prompt.push_str(task);
    if !scratchpad.is_empty() {
        prompt.push_str("\n\nObservations:\n");
        prompt.push_str(&scratchpad.join("\n"));
    }
    prompt
}

// ---------------------------------------------------------------------------
// Long-term memory
// ---------------------------------------------------------------------------

fn recall_long_term(cx: &NodeCx, config: &AgentMemory, agent_id: &str, session: &str) -> String {
    let memory = cx.engine().memory();
    let limit = config.recall_limit;
    let mut sections = Vec::new();

    let facts: Vec<String> = memory
        .semantic()
        .entities_by_domain(&config.domain)
        .into_iter()
        .take(limit)
        .map(|e| format!("- {} ({}): {}", e.name, e.entity_type, template::to_text(&e.attributes)))
        .collect();
    if !facts.is_empty() {
        sections.push(format!("Known facts:\n{}", facts.join("\n")));
    }

    let history: Vec<String> = memory
        .episodic()
        .recent(session, limit)
        .into_iter()
        .map(|e| format!("- {}: {}", e.actor, template::to_text(&e.content)))
        .collect();
    if !history.is_empty() {
        sections.push(format!("Earlier in this session:\n{}", history.join("\n")));
    }

    if let Some(best) = memory.procedural().best(&config.domain, agent_id) {
        if best.successes > 0 {
            let steps = if best.steps.is_empty() {
                "answer directly".to_owned()
            } else {
                best.steps.join(" -> ")
            };
            sections.push(format!(
                "An approach that worked before ({:.0}% of {} runs): {}",
                best.success_rate() * 100.0,
                best.attempts,
                steps
            ));
        }
    }
    sections.join("\n\n")
}

#[allow(clippy::too_many_arguments)]
async fn persist(
    cx: &NodeCx,
    config: &AgentMemory,
    agent_id: &str,
    session: &str,
    content: Value,
    steps: &[String],
    success: bool,
    elapsed: Duration,
) -> Result<(), EngineError> {
    if !config.remember {
        return Ok(());
    }
    let memory = cx.engine().memory();
    let to_engine = |e: memory::MemoryError| EngineError::Memory {
        node_id: cx.node_id().to_owned(),
        message: e.to_string(),
    };
    memory
        .record_episode(Episode::new(session, &config.domain, agent_id, content))
        .await
        .map_err(to_engine)?;
    let name = if steps.is_empty() { "direct".to_owned() } else { steps.join(">") };
    memory
        .record_procedure_outcome(&config.domain, agent_id, &name, steps, success, elapsed)
        .await
        .map_err(to_engine)?;
    Ok(())
}

async fn remember(cx: &NodeCx, agent: &AgentNode, args: &Value) -> Result<Value, EngineError> {
    let Some(config) = &agent.memory else {
        return Err(EngineError::fatal(cx.node_id(), "remember needs a memory domain"));
    };
    let Some(name) = args.get("name").and_then(Value::as_str) else {
        return Err(EngineError::fatal(cx.node_id(), "remember needs a 'name'"));
    };
    let entity_type = args.get("type").and_then(Value::as_str).unwrap_or("fact");
    let attributes = args.get("attributes").cloned().unwrap_or(Value::Null);
    cx.engine()
        .memory()
        .remember_entity(Entity::new(&config.domain, name, entity_type, attributes))
        .await
        .map_err(|e| EngineError::Memory {
            node_id: cx.node_id().to_owned(),
            message: e.to_string(),
        })?;
    Ok(json!({"stored": name}))
}

fn recall(cx: &NodeCx, agent: &AgentNode, args: &Value) -> Value {
    let Some(config) = &agent.memory else {
        return json!([]);
    };
    let semantic = cx.engine().memory().semantic();
    let entities = match args.get("type").and_then(Value::as_str) {
        Some(entity_type) => semantic.entities_of_type(&config.domain, entity_type),
        None => semantic.entities_by_domain(&config.domain),
    };
    entities
        .into_iter()
        .map(|e| json!({"name": e.name, "type": e.entity_type, "attributes": e.attributes}))
        .collect()
}
