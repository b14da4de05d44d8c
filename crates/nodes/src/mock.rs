//! Test doubles for the collaborator traits.
//!
//! Useful in unit and integration tests where a real tool, model vendor or
//! sandbox is either unavailable or irrelevant.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{
    Generation, ModelConfig, ModelProvider, NodeError, Sandbox, TokenUsage, Tool, ToolContext,
};

// ---------------------------------------------------------------------------
// MockTool
// ---------------------------------------------------------------------------

/// Behaviour injected into `MockTool` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Return the arguments unchanged.
    Echo,
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail with `Retryable` for the first `failures` calls, then return `value`.
    Flaky { failures: usize, value: Value },
}

/// A mock tool that records every call it receives and returns a
/// programmer-specified result.
pub struct MockTool {
    /// Tool name used for registration.
    pub name: String,
    /// What the tool will do when `execute` is called.
    pub behaviour: MockBehaviour,
    /// Optional artificial latency per call.
    pub delay: Option<Duration>,
    /// All arguments seen by this tool (in call order).
    pub calls: Arc<Mutex<Vec<Value>>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MockTool {
    fn with_behaviour(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that returns its arguments.
    pub fn echo(name: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Echo)
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailRetryable(msg.into()))
    }

    /// Create a mock that fails `failures` times before succeeding.
    pub fn flaky(name: impl Into<String>, failures: usize, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::Flaky { failures, value })
    }

    /// Add artificial latency to every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times this tool has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of overlapping executions observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Tool for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "mock tool"
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, NodeError> {
        let call_index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(args.clone());
            calls.len()
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(self.in_flight.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(v.clone()),
            MockBehaviour::Echo => Ok(args),
            MockBehaviour::FailRetryable(msg) => Err(NodeError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(NodeError::Fatal(msg.clone())),
            MockBehaviour::Flaky { failures, value } => {
                if call_index <= *failures {
                    Err(NodeError::Retryable(format!("transient failure #{call_index}")))
                } else {
                    Ok(value.clone())
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MockModel
// ---------------------------------------------------------------------------

/// A scripted model provider.
///
/// Replies are consumed in order; once the script is exhausted every further
/// call returns the fallback generation.
pub struct MockModel {
    script: Mutex<VecDeque<Result<Generation, NodeError>>>,
    fallback: Generation,
    prompts: Arc<Mutex<Vec<String>>>,
    configs: Arc<Mutex<Vec<ModelConfig>>>,
}

impl MockModel {
    /// A model that always answers `text`, reporting `tokens` completion tokens.
    pub fn replying(text: impl Into<String>, tokens: u64) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Generation::text(text, TokenUsage::new(0, tokens)),
            prompts: Arc::new(Mutex::new(Vec::new())),
            configs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A model that plays back `replies` and then answers `"done"`.
    pub fn scripted(replies: Vec<Result<Generation, NodeError>>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            fallback: Generation::text("done", TokenUsage::default()),
            prompts: Arc::new(Mutex::new(Vec::new())),
            configs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Replace the generation returned after the script runs out.
    pub fn with_fallback(mut self, fallback: Generation) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    /// Every prompt received, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    /// Every config received, in call order.
    pub fn configs(&self) -> Vec<ModelConfig> {
        self.configs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelProvider for MockModel {
    async fn generate(&self, prompt: &str, config: &ModelConfig) -> Result<Generation, NodeError> {
        self.prompts.lock().unwrap().push(prompt.to_owned());
        self.configs.lock().unwrap().push(config.clone());

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(reply) => reply,
            None => Ok(self.fallback.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// MockSandbox
// ---------------------------------------------------------------------------

/// A sandbox that enforces the import allow-list and echoes its inputs.
///
/// Lines of the form `import x` or `from x import y` are checked against the
/// allow-list; anything else is treated as opaque code.
#[derive(Default)]
pub struct MockSandbox {
    pub runs: Arc<Mutex<Vec<String>>>,
}

impl MockSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }
}

fn imported_modules(code: &str) -> Vec<&str> {
    code.lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line
                .strip_prefix("import ")
                .or_else(|| line.strip_prefix("from "))?;
            rest.split(|c: char| c.is_whitespace() || c == ',' || c == '.')
                .find(|s| !s.is_empty())
        })
        .collect()
}

#[async_trait]
impl Sandbox for MockSandbox {
    async fn run_sandboxed(
        &self,
        code: &str,
        inputs: Value,
        allowed_imports: &[String],
    ) -> Result<Value, NodeError> {
        self.runs.lock().unwrap().push(code.to_owned());

        for module in imported_modules(code) {
            if !allowed_imports.iter().any(|allowed| allowed == module) {
                return Err(NodeError::SandboxViolation(format!(
                    "import of '{module}' is not allowed"
                )));
            }
        }

        Ok(json!({ "result": inputs, "lines": code.lines().count() }))
    }
}
