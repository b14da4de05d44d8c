//! `nodes` crate: contracts for the external collaborators the engine calls.
//!
//! The engine never talks to an HTTP client, a model vendor or a code
//! sandbox directly. It goes through the [`Tool`], [`ModelProvider`] and
//! [`Sandbox`] traits defined here, so concrete adapters live outside the
//! engine and tests can plug in the doubles from [`mock`].

pub mod error;
pub mod traits;
pub mod registry;
pub mod mock;

pub use error::NodeError;
pub use registry::ToolRegistry;
pub use traits::{
    Generation, ModelConfig, ModelProvider, Sandbox, TokenUsage, Tool, ToolCall, ToolContext,
    ToolSpec,
};
