//! Lifecycle events streamed to an optional observer.
//!
//! The engine never blocks on observers: events go over an unbounded channel
//! and are dropped silently once the receiver is gone.

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::{NodeExecutionResult, RunResult, SkipReason};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    WorkflowStarted {
        run_id: Uuid,
        name: String,
        levels: usize,
    },
    NodeStarted {
        run_id: Uuid,
        node_id: String,
    },
    NodeCompleted {
        run_id: Uuid,
        node_id: String,
        result: Box<NodeExecutionResult>,
    },
    NodeSkipped {
        run_id: Uuid,
        node_id: String,
        reason: SkipReason,
    },
    WorkflowFinished {
        run_id: Uuid,
        result: Box<RunResult>,
    },
}

pub type EventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Cloneable handle that forwards to the observer, if any.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<EventSender>);

impl EventSink {
    pub fn new(sender: EventSender) -> Self {
        Self(Some(sender))
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}
