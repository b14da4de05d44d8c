//! End-to-end tests for the workflow executor.
//!
//! Every collaborator is a double from `nodes::mock`, so these run without
//! network access. Latency is simulated with paused tokio time.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use memory::MemorySystem;
use nodes::mock::{MockModel, MockSandbox, MockTool};
use nodes::{Generation, NodeError, TokenUsage};

use crate::{
    event_channel, AgentNode, BudgetLimits, Blueprint, EngineConfig, EngineContext, EngineError,
    EngineEvent, ErrorKind, FailurePolicy, NodeConfig, NodeStatus, RecursiveNode, RunResult,
    SkipReason, WorkflowExecutor,
};

fn executor(tools: &[Arc<MockTool>], model: Option<Arc<MockModel>>) -> WorkflowExecutor {
    executor_with(tools, model, EngineConfig::default())
}

fn executor_with(
    tools: &[Arc<MockTool>],
    model: Option<Arc<MockModel>>,
    config: EngineConfig,
) -> WorkflowExecutor {
    let mut builder = EngineContext::builder().config(config);
    for tool in tools {
        builder = builder.tool(tool.clone());
    }
    if let Some(model) = model {
        builder = builder.model(model);
    }
    WorkflowExecutor::new(builder.build())
}

fn fast_retries() -> EngineConfig {
    EngineConfig {
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 100,
        ..EngineConfig::default()
    }
}

fn error_kind(result: &RunResult, node_id: &str) -> Option<ErrorKind> {
    result.result(node_id)?.error.as_ref().map(|e| e.kind)
}

// ============================================================
// Scheduling
// ============================================================

#[tokio::test(start_paused = true)]
async fn fan_out_runs_one_level_and_honours_max_parallel() {
    let work = Arc::new(
        MockTool::returning("work", json!({"ok": true})).with_delay(Duration::from_millis(20)),
    );
    let exec = executor(&[work.clone()], None);
    let blueprint = Blueprint::new(
        "fan-out",
        vec![
            NodeConfig::tool("a", "work", json!({})),
            NodeConfig::tool("b", "work", json!({})).depends_on(&["a"]),
            NodeConfig::tool("c", "work", json!({})).depends_on(&["a"]),
        ],
    )
    .with_max_parallel(1);

    let plan = exec.plan(&blueprint).unwrap();
    assert_eq!(
        plan.graph().levels(),
        &[vec!["a".to_string()], vec!["b".to_string(), "c".to_string()]]
    );

    let result = exec.run(&blueprint).await.unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(work.call_count(), 3);
    assert_eq!(work.peak_concurrency(), 1);
    assert_eq!(result.result("b").unwrap().metadata.level, 1);
}

#[tokio::test(start_paused = true)]
async fn independent_nodes_run_up_to_max_parallel_at_once() {
    let work =
        Arc::new(MockTool::returning("work", json!(1)).with_delay(Duration::from_millis(50)));
    let exec = executor(&[work.clone()], None);
    let nodes = (0..6).map(|i| NodeConfig::tool(format!("n{i}"), "work", json!({}))).collect();

    let result = exec.run(&Blueprint::new("wide", nodes).with_max_parallel(3)).await.unwrap();
    assert!(result.success);
    assert_eq!(work.peak_concurrency(), 3);
}

#[tokio::test]
async fn build_errors_are_returned_before_anything_runs() {
    let work = Arc::new(MockTool::returning("work", json!(1)));
    let exec = executor(&[work.clone()], None);

    let cyclic = Blueprint::new(
        "cyclic",
        vec![
            NodeConfig::tool("a", "work", json!({})).depends_on(&["b"]),
            NodeConfig::tool("b", "work", json!({})).depends_on(&["a"]),
        ],
    );
    assert!(matches!(exec.run(&cyclic).await, Err(EngineError::CycleDetected { .. })));

    let unknown_tool = Blueprint::new("unknown", vec![NodeConfig::tool("a", "missing", json!({}))]);
    assert!(matches!(exec.run(&unknown_tool).await, Err(EngineError::InvalidBlueprint { .. })));

    let no_model = Blueprint::new("no-model", vec![NodeConfig::llm("a", "hello")]);
    assert!(matches!(exec.run(&no_model).await, Err(EngineError::InvalidBlueprint { .. })));
    assert_eq!(work.call_count(), 0);
}

#[tokio::test]
async fn lifecycle_events_are_streamed() {
    let work = Arc::new(MockTool::returning("work", json!(1)));
    let (tx, mut rx) = event_channel();
    let exec = executor(&[work], None).with_events(tx);
    let blueprint = Blueprint::new(
        "events",
        vec![
            NodeConfig::tool("a", "work", json!({})),
            NodeConfig::tool("b", "work", json!({})).depends_on(&["a"]),
        ],
    );
    exec.run(&blueprint).await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(events.first(), Some(EngineEvent::WorkflowStarted { levels: 2, .. })));
    assert!(matches!(events.last(), Some(EngineEvent::WorkflowFinished { .. })));
    let completed = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::NodeCompleted { .. }))
        .count();
    assert_eq!(completed, 2);
}

// ============================================================
// Context and placeholders
// ============================================================

#[tokio::test]
async fn placeholders_resolve_against_upstream_outputs() {
    let source = Arc::new(MockTool::returning(
        "source",
        json!({"user": {"name": "ada", "tags": ["admin", "ops"]}}),
    ));
    let echo = Arc::new(MockTool::echo("echo"));
    let exec = executor(&[source, echo], None);
    let blueprint = Blueprint::new(
        "placeholders",
        vec![
            NodeConfig::tool("fetch", "source", json!({})),
            NodeConfig::tool(
                "render",
                "echo",
                json!({
                    "greeting": "hi {{fetch.user.name}} from {{inputs.team}}",
                    "first_tag": "{{fetch.user.tags[0]}}",
                    "user": "{{fetch.user}}",
                }),
            )
            .depends_on(&["fetch"]),
        ],
    )
    .with_inputs(json!({"team": "infra"}));

    let first = exec.run(&blueprint).await.unwrap();
    let expected = json!({
        "greeting": "hi ada from infra",
        "first_tag": "admin",
        "user": {"name": "ada", "tags": ["admin", "ops"]},
    });
    assert_eq!(first.output("render"), Some(&expected));

    let second = exec.run(&blueprint).await.unwrap();
    assert_eq!(second.output("render"), first.output("render"));
    assert_ne!(second.run_id, first.run_id);
}

#[tokio::test]
async fn output_schema_violation_fails_the_node() {
    let tool = Arc::new(MockTool::returning("count", json!({"n": "three"})));
    let exec = executor(&[tool], None);
    let blueprint = Blueprint::new(
        "schema",
        vec![NodeConfig::tool("count", "count", json!({})).with_output_schema(json!({
            "type": "object",
            "required": ["n"],
            "properties": {"n": {"type": "integer"}}
        }))],
    );

    let result = exec.run(&blueprint).await.unwrap();
    assert!(!result.success);
    assert_eq!(error_kind(&result, "count"), Some(ErrorKind::SchemaViolation));
}

#[tokio::test]
async fn input_schema_violation_names_the_path_and_skips_the_call() {
    let echo = Arc::new(MockTool::echo("lookup"));
    let exec = executor(&[echo.clone()], None);
    let blueprint = Blueprint::new(
        "input-schema",
        vec![NodeConfig::tool("lookup", "lookup", json!({"code": "{{inputs.code}}"}))
            .with_input_schema(json!({
                "type": "object",
                "properties": {"code": {"type": "string", "pattern": "^[a-z]+$"}}
            }))],
    )
    .with_inputs(json!({"code": "ABC123"}));

    let result = exec.run(&blueprint).await.unwrap();
    assert_eq!(error_kind(&result, "lookup"), Some(ErrorKind::SchemaViolation));
    let message = &result.result("lookup").unwrap().error.as_ref().unwrap().message;
    assert!(message.contains("/code"), "{message}");
    assert_eq!(echo.call_count(), 0);
}

#[tokio::test]
async fn uncompilable_schema_is_rejected_before_the_run() {
    let tool = Arc::new(MockTool::returning("count", json!(1)));
    let exec = executor(&[tool.clone()], None);
    let blueprint = Blueprint::new(
        "bad-schema",
        vec![NodeConfig::tool("count", "count", json!({}))
            .with_output_schema(json!({"type": 5}))],
    );

    let err = exec.run(&blueprint).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidBlueprint { ref node_id, .. } if node_id == "count"));
    assert_eq!(tool.call_count(), 0);
}

// ============================================================
// Failure policies
// ============================================================

#[tokio::test]
async fn halt_records_nothing_for_later_levels() {
    let ok = Arc::new(MockTool::returning("ok", json!(1)));
    let broken = Arc::new(MockTool::failing_fatal("broken", "disk full"));
    let exec = executor(&[ok.clone(), broken], None);
    let blueprint = Blueprint::new(
        "halt",
        vec![
            NodeConfig::tool("a", "broken", json!({})),
            NodeConfig::tool("s", "ok", json!({})),
            NodeConfig::tool("c", "ok", json!({})).depends_on(&["s"]),
        ],
    );

    let result = exec.run(&blueprint).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.status("a"), Some(NodeStatus::Failed));
    assert!(result.result("c").is_none());
    let error = result.error.unwrap();
    assert_eq!(error.node_id.as_deref(), Some("a"));
    assert_eq!(error.kind, ErrorKind::Execution);
}

#[tokio::test(start_paused = true)]
async fn halt_cancels_slow_siblings_in_the_same_level() {
    let slow = Arc::new(MockTool::returning("slow", json!(1)).with_delay(Duration::from_secs(60)));
    let broken = Arc::new(MockTool::failing_fatal("broken", "disk full"));
    let exec = executor(&[slow.clone(), broken], None);
    let blueprint = Blueprint::new(
        "halt-siblings",
        vec![
            NodeConfig::tool("a", "broken", json!({})),
            NodeConfig::tool("s", "slow", json!({})),
        ],
    );

    let started = tokio::time::Instant::now();
    let result = exec.run(&blueprint).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(60));
    assert!(!result.success);
    assert_eq!(result.status("s"), Some(NodeStatus::Failed));
    assert_eq!(error_kind(&result, "s"), Some(ErrorKind::Cancelled));
    assert_eq!(result.error.unwrap().node_id.as_deref(), Some("a"));
}

#[tokio::test]
async fn continue_possible_prunes_only_dependents() {
    let ok = Arc::new(MockTool::returning("ok", json!(1)));
    let broken = Arc::new(MockTool::failing_fatal("broken", "bad input"));
    let exec = executor(&[ok, broken], None);
    let blueprint = Blueprint::new(
        "prune",
        vec![
            NodeConfig::tool("a", "broken", json!({})),
            NodeConfig::tool("b", "ok", json!({})).depends_on(&["a"]),
            NodeConfig::tool("b2", "ok", json!({})).depends_on(&["b"]),
            NodeConfig::tool("c", "ok", json!({})),
            NodeConfig::tool("d", "ok", json!({})).depends_on(&["c"]),
        ],
    )
    .with_policy(FailurePolicy::ContinuePossible);

    let result = exec.run(&blueprint).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_ref().and_then(|e| e.node_id.as_deref()), Some("a"));
    assert_eq!(
        result.result("b").unwrap().skip_reason,
        Some(SkipReason::UpstreamFailed { dependency: "a".into() })
    );
    assert_eq!(result.status("b2"), Some(NodeStatus::Skipped));
    assert_eq!(result.status("c"), Some(NodeStatus::Succeeded));
    assert_eq!(result.status("d"), Some(NodeStatus::Succeeded));
}

#[tokio::test]
async fn always_lets_dependents_run_after_a_failure() {
    let ok = Arc::new(MockTool::returning("ok", json!(1)));
    let broken = Arc::new(MockTool::failing_fatal("broken", "flaky upstream"));
    let exec = executor(&[ok, broken], None);
    let blueprint = Blueprint::new(
        "always",
        vec![
            NodeConfig::tool("a", "broken", json!({})).with_policy(FailurePolicy::Always),
            NodeConfig::tool("b", "ok", json!({})).depends_on(&["a"]),
        ],
    );

    let result = exec.run(&blueprint).await.unwrap();
    assert_eq!(result.status("a"), Some(NodeStatus::Failed));
    assert_eq!(result.status("b"), Some(NodeStatus::Succeeded));
}

// ============================================================
// Retries and timeouts
// ============================================================

#[tokio::test(start_paused = true)]
async fn retryable_failures_are_retried_with_backoff() {
    let flaky = Arc::new(MockTool::flaky("flaky", 2, json!({"ok": true})));
    let exec = executor_with(&[flaky.clone()], None, fast_retries());
    let blueprint =
        Blueprint::new("retry", vec![NodeConfig::tool("f", "flaky", json!({})).with_retries(3)]);

    let result = exec.run(&blueprint).await.unwrap();
    assert!(result.success);
    assert_eq!(flaky.call_count(), 3);
    assert_eq!(result.result("f").unwrap().metadata.attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_are_reported() {
    let down = Arc::new(MockTool::failing_retryable("down", "503"));
    let exec = executor_with(&[down.clone()], None, fast_retries());
    let blueprint =
        Blueprint::new("exhaust", vec![NodeConfig::tool("f", "down", json!({})).with_retries(2)]);

    let result = exec.run(&blueprint).await.unwrap();
    assert_eq!(error_kind(&result, "f"), Some(ErrorKind::RetryExhausted));
    assert_eq!(down.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn slow_tools_time_out() {
    let slow = Arc::new(MockTool::returning("slow", json!(1)).with_delay(Duration::from_secs(5)));
    let exec = executor(&[slow], None);
    let blueprint = Blueprint::new(
        "timeout",
        vec![NodeConfig::tool("s", "slow", json!({}))
            .with_retries(0)
            .with_timeout(Duration::from_millis(100))],
    );

    let result = exec.run(&blueprint).await.unwrap();
    assert_eq!(error_kind(&result, "s"), Some(ErrorKind::Timeout));
}

#[tokio::test]
async fn sandbox_violations_are_not_retried() {
    let sandbox = Arc::new(MockSandbox::new());
    let engine = EngineContext::builder().sandbox(sandbox.clone()).build();
    let exec = WorkflowExecutor::new(engine);
    let mut node =
        NodeConfig::code("script", "import os\nprint(1)", json!({"x": 1})).with_retries(3);
    if let crate::NodeKind::Code(code) = &mut node.kind {
        code.allowed_imports = vec!["json".into()];
    }

    let result = exec.run(&Blueprint::new("sandbox", vec![node])).await.unwrap();
    assert_eq!(error_kind(&result, "script"), Some(ErrorKind::SandboxViolation));
    assert_eq!(sandbox.run_count(), 1);
}

// ============================================================
// Control flow
// ============================================================

#[tokio::test]
async fn condition_activates_only_the_taken_branch() {
    let ok = Arc::new(MockTool::returning("ok", json!("ran")));
    let exec = executor(&[ok.clone()], None);
    let blueprint = Blueprint::new(
        "route",
        vec![
            NodeConfig::condition("gate", "{{inputs.score}} > 5", &["x"], &["y"]),
            NodeConfig::tool("x", "ok", json!({})),
            NodeConfig::tool("y", "ok", json!({})),
            NodeConfig::tool("after_x", "ok", json!({})).depends_on(&["x"]),
        ],
    )
    .with_inputs(json!({"score": 3}));

    let result = exec.run(&blueprint).await.unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.output("gate").unwrap()["decision"], json!(false));
    assert_eq!(
        result.result("x").unwrap().skip_reason,
        Some(SkipReason::BranchNotTaken { condition: "gate".into() })
    );
    assert_eq!(
        result.result("after_x").unwrap().skip_reason,
        Some(SkipReason::DependenciesSkipped)
    );
    assert_eq!(result.status("y"), Some(NodeStatus::Succeeded));
    assert_eq!(ok.call_count(), 1);
}

#[tokio::test]
async fn loop_over_an_empty_list_outputs_an_empty_array() {
    let echo = Arc::new(MockTool::echo("echo"));
    let exec = executor(&[echo.clone()], None);
    let blueprint = Blueprint::new(
        "empty-loop",
        vec![
            NodeConfig::loop_over("each", "inputs.items", &["body"]),
            NodeConfig::tool("body", "echo", json!({"v": "{{loop.item}}"})),
        ],
    )
    .with_inputs(json!({"items": []}));

    let result = exec.run(&blueprint).await.unwrap();
    assert!(result.success);
    assert_eq!(result.output("each"), Some(&json!([])));
    assert!(result.result("body").is_none());
    assert_eq!(echo.call_count(), 0);
}

#[tokio::test]
async fn loop_runs_the_body_once_per_item() {
    let echo = Arc::new(MockTool::echo("echo"));
    let exec = executor(&[echo.clone()], None);
    let blueprint = Blueprint::new(
        "loop",
        vec![
            NodeConfig::loop_over("each", "{{inputs.items}}", &["body"]),
            NodeConfig::tool("body", "echo", json!({"v": "{{loop.item}}", "i": "{{loop.index}}"})),
        ],
    )
    .with_inputs(json!({"items": ["a", "b", "c"]}));

    let result = exec.run(&blueprint).await.unwrap();
    assert!(result.success, "{:?}", result.error);
    let iterations = result.output("each").unwrap().as_array().unwrap().clone();
    assert_eq!(iterations.len(), 3);
    assert_eq!(iterations[1]["outputs"]["body"], json!({"v": "b", "i": 1}));
    assert!(iterations.iter().all(|it| it["success"] == json!(true)));
    assert_eq!(echo.call_count(), 3);
}

#[tokio::test]
async fn loop_iterations_fail_independently_under_continue_possible() {
    let echo = Arc::new(MockTool::echo("echo"));
    let exec = executor(&[echo], None);
    let mut each = NodeConfig::loop_over("each", "inputs.items", &["check"]);
    if let crate::NodeKind::Loop(spec) = &mut each.kind {
        spec.iteration_policy = Some(FailurePolicy::ContinuePossible);
    }
    let blueprint = Blueprint::new(
        "loop-failures",
        vec![
            each,
            NodeConfig::tool("check", "echo", json!({"v": "{{loop.item}}"})).with_output_schema(
                json!({"type": "object", "properties": {"v": {"type": "integer"}}}),
            ),
        ],
    )
    .with_inputs(json!({"items": [1, "two", 3]}));

    let result = exec.run(&blueprint).await.unwrap();
    assert_eq!(result.status("each"), Some(NodeStatus::Succeeded));
    let iterations = result.output("each").unwrap().as_array().unwrap().clone();
    assert_eq!(iterations[0]["success"], json!(true));
    assert_eq!(iterations[1]["success"], json!(false));
    assert!(iterations[1]["errors"]["check"].is_string());
    assert_eq!(iterations[2]["success"], json!(true));
}

#[tokio::test]
async fn parallel_node_joins_its_branches() {
    let a = Arc::new(MockTool::returning("a", json!("A")));
    let b = Arc::new(MockTool::returning("b", json!("B")));
    let exec = executor(&[a, b], None);
    let blueprint = Blueprint::new(
        "parallel",
        vec![
            NodeConfig::tool("left", "a", json!({})),
            NodeConfig::tool("right", "b", json!({})),
            NodeConfig::parallel("both", &[&["left"], &["right"]]),
        ],
    );

    let result = exec.run(&blueprint).await.unwrap();
    assert!(result.success);
    let output = result.output("both").unwrap();
    assert_eq!(output["branches"], json!([{"left": "A"}, {"right": "B"}]));
    assert_eq!(output["failed"], json!([]));
}

#[tokio::test]
async fn sub_workflow_runs_with_merged_inputs() {
    let echo = Arc::new(MockTool::echo("echo"));
    let exec = executor(&[echo], None);
    let child = Blueprint::new(
        "greeter",
        vec![NodeConfig::tool(
            "say",
            "echo",
            json!({"msg": "{{inputs.greeting}} {{inputs.name}}"}),
        )],
    )
    .with_inputs(json!({"greeting": "hello", "name": "nobody"}));
    let blueprint = Blueprint::new(
        "parent",
        vec![
            NodeConfig::workflow("greet", child, json!({"name": "{{inputs.user}}"})),
            NodeConfig::tool("relay", "echo", json!({"heard": "{{greet.outputs.say.msg}}"}))
                .depends_on(&["greet"]),
        ],
    )
    .with_inputs(json!({"user": "ada"}));

    let result = exec.run(&blueprint).await.unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.output("relay"), Some(&json!({"heard": "hello ada"})));
    let nested_run = result.output("greet").unwrap()["run_id"].clone();
    assert_ne!(nested_run, json!(result.run_id));
}

// ============================================================
// Budget and agents
// ============================================================

#[tokio::test]
async fn token_budget_rejects_the_call_that_would_overrun() {
    let model = Arc::new(MockModel::replying("summary", 400));
    let exec = executor(&[], Some(model.clone()));
    let blueprint = Blueprint::new(
        "budget",
        vec![
            NodeConfig::llm("first", "one"),
            NodeConfig::llm("second", "two").depends_on(&["first"]),
            NodeConfig::llm("third", "three").depends_on(&["second"]),
        ],
    )
    .with_budget(BudgetLimits::tokens(1000));

    let result = exec.run(&blueprint).await.unwrap();
    assert!(!result.success);
    assert_eq!(model.call_count(), 2);
    assert_eq!(result.total_tokens, 800);
    assert_eq!(error_kind(&result, "third"), Some(ErrorKind::BudgetExceeded));
    assert_eq!(result.error.unwrap().kind, ErrorKind::BudgetExceeded);
}

#[tokio::test]
async fn agent_calling_itself_is_a_cycle() {
    let model = Arc::new(MockModel::scripted(vec![Ok(Generation::tool_call(
        "planner",
        json!({"prompt": "plan again"}),
        TokenUsage::new(5, 5),
    ))]));
    let exec = executor(&[], Some(model.clone()));
    let blueprint = Blueprint::new(
        "self-call",
        vec![NodeConfig::agent(
            "planner",
            AgentNode::new("make a plan", 4).with_tools(&["planner"]),
        )],
    );

    let result = exec.run(&blueprint).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::AgentCycle);
    assert_eq!(error_kind(&result, "planner"), Some(ErrorKind::AgentCycle));
    assert_eq!(model.call_count(), 1);
}

#[tokio::test]
async fn agent_step_cap_stops_a_runaway_agent() {
    let lookup = Arc::new(MockTool::returning("lookup", json!({"hits": 0})));
    let model = Arc::new(
        MockModel::scripted(Vec::new())
            .with_fallback(Generation::tool_call("lookup", json!({}), TokenUsage::new(1, 1))),
    );
    let exec = executor(&[lookup.clone()], Some(model.clone()));
    let blueprint = Blueprint::new(
        "runaway",
        vec![NodeConfig::agent("searcher", AgentNode::new("find it", 3).with_tools(&["lookup"]))],
    );

    let result = exec.run(&blueprint).await.unwrap();
    assert_eq!(result.error.unwrap().kind, ErrorKind::AgentStepLimit);
    assert_eq!(model.call_count(), 3);
    assert_eq!(lookup.call_count(), 3);
}

#[tokio::test]
async fn agent_delegates_to_another_agent() {
    let model = Arc::new(MockModel::scripted(vec![
        Ok(Generation::tool_call("researcher", json!({"prompt": "dig"}), TokenUsage::new(1, 1))),
        Ok(Generation::text("facts", TokenUsage::new(1, 1))),
        Ok(Generation::text("final answer", TokenUsage::new(1, 1))),
    ]));
    let exec = executor(&[], Some(model.clone()));
    let blueprint = Blueprint::new(
        "delegate",
        vec![
            NodeConfig::agent("lead", AgentNode::new("answer", 3).with_tools(&["researcher"])),
            NodeConfig::agent("researcher", AgentNode::new("{{inputs.topic}}", 2))
                .depends_on(&["lead"]),
        ],
    )
    .with_inputs(json!({"topic": "rust"}));

    let result = exec.run(&blueprint).await.unwrap();
    assert!(result.success, "{:?}", result.error);
    let lead = result.output("lead").unwrap();
    assert_eq!(lead["answer"], json!("final answer"));
    assert_eq!(lead["tool_calls"], json!(["researcher"]));
    assert!(model.prompts()[2].contains("facts"));
}

#[tokio::test]
async fn agent_memory_is_recorded_and_working_memory_released() {
    let memory = Arc::new(MemorySystem::new());
    let lookup = Arc::new(MockTool::returning("lookup", json!({"plan": "gold"})));
    let model = Arc::new(MockModel::scripted(vec![
        Ok(Generation::tool_call("lookup", json!({"q": "acme"}), TokenUsage::new(2, 2))),
        Ok(Generation::tool_call(
            "remember",
            json!({"name": "acme", "type": "customer", "attributes": {"plan": "gold"}}),
            TokenUsage::new(2, 2),
        )),
        Ok(Generation::text("acme is on gold", TokenUsage::new(2, 2))),
    ]));
    let engine = EngineContext::builder()
        .tool(lookup)
        .model(model.clone())
        .memory(memory.clone())
        .build();
    let exec = WorkflowExecutor::new(engine);
    let blueprint = Blueprint::new(
        "support",
        vec![NodeConfig::agent(
            "helper",
            AgentNode::new("what plan is acme on?", 5)
                .with_tools(&["lookup", "remember"])
                .with_memory("support"),
        )],
    );

    let result = exec.run(&blueprint).await.unwrap();
    assert!(result.success, "{:?}", result.error);
    assert!(model.prompts()[1].contains("gold"));

    let acme = memory.semantic().entity("support", "acme").unwrap();
    assert_eq!(acme.entity_type, "customer");
    assert_eq!(memory.episodic().by_domain("support").len(), 1);
    let procedure = memory.procedural().best("support", "helper").unwrap();
    assert_eq!(procedure.steps, vec!["lookup".to_string(), "remember".to_string()]);
    assert_eq!(procedure.successes, 1);
    assert_eq!(memory.active_runs(), 0);

    // A second run starts with what the first one learned.
    exec.run(&blueprint).await.unwrap();
    assert!(model.prompts()[3].contains("acme (customer)"));
}

#[tokio::test]
async fn recursive_node_stops_at_max_rounds() {
    let model = Arc::new(MockModel::replying("another point", 3));
    let exec = executor(&[], Some(model.clone()));
    let blueprint = Blueprint::new(
        "debate",
        vec![NodeConfig::recursive(
            "debate",
            RecursiveNode {
                participants: vec![
                    AgentNode::new("argue for, round {{round}}", 1).with_id("pro"),
                    AgentNode::new("argue against: {{last}}", 1).with_id("con"),
                ],
                prompt: "tabs or spaces".into(),
                max_rounds: Some(2),
                until: Some("{{round}} > 10".into()),
            },
        )],
    );

    let result = exec.run(&blueprint).await.unwrap();
    let output = result.output("debate").unwrap();
    assert_eq!(output["rounds"], json!(2));
    assert_eq!(output["converged"], json!(false));
    assert_eq!(output["transcript"].as_array().unwrap().len(), 4);
    assert_eq!(model.call_count(), 4);
    assert!(model.prompts()[2].contains("round 2"));
}

#[tokio::test]
async fn recursive_node_stops_early_once_converged() {
    let model = Arc::new(MockModel::replying("we agree", 3));
    let exec = executor(&[], Some(model.clone()));
    let blueprint = Blueprint::new(
        "consensus",
        vec![NodeConfig::recursive(
            "talk",
            RecursiveNode {
                participants: vec![
                    AgentNode::new("speak", 1).with_id("a"),
                    AgentNode::new("reply", 1).with_id("b"),
                ],
                prompt: "{{inputs.topic}}".into(),
                max_rounds: Some(5),
                until: Some("{{last}} contains 'agree'".into()),
            },
        )],
    )
    .with_inputs(json!({"topic": "naming"}));

    let result = exec.run(&blueprint).await.unwrap();
    let output = result.output("talk").unwrap();
    assert_eq!(output["rounds"], json!(1));
    assert_eq!(output["converged"], json!(true));
    assert_eq!(output["last"], Value::String("we agree".into()));
    assert_eq!(model.call_count(), 2);
}

#[tokio::test]
async fn model_errors_fail_only_the_node() {
    let model =
        Arc::new(MockModel::scripted(vec![Err(NodeError::Fatal("content filtered".into()))]));
    let exec = executor(&[], Some(model));
    let blueprint = Blueprint::new("filtered", vec![NodeConfig::llm("ask", "hi")]);

    let result = exec.run(&blueprint).await.unwrap();
    assert_eq!(error_kind(&result, "ask"), Some(ErrorKind::Execution));
    assert_eq!(result.error.unwrap().node_id.as_deref(), Some("ask"));
}
