//! Node input and output contracts.
//!
//! Declared schemas are compiled with `jsonschema` when the plan is built, so
//! an invalid schema is rejected before any node runs. A value that violates
//! a schema is a `SchemaViolation` listing every failing instance path.

use std::fmt;

use jsonschema::JSONSchema;
use serde_json::Value;

use crate::error::EngineError;
use crate::models::NodeConfig;

/// One compiled JSON Schema.
pub struct CompiledSchema {
    schema: Value,
    validator: JSONSchema,
}

impl CompiledSchema {
    pub fn compile(schema: &Value) -> Result<Self, String> {
        let validator =
            JSONSchema::compile(schema).map_err(|e| format!("invalid JSON schema: {e}"))?;
        Ok(Self {
            schema: schema.clone(),
            validator,
        })
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// Checks `value`, reporting every violation as `path: message`.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        self.validator.validate(value).map_err(|errors| {
            errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    let path = if path.is_empty() { "/" } else { path.as_str() };
                    format!("{path}: {e}")
                })
                .collect::<Vec<_>>()
                .join("; ")
        })
    }
}

impl fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledSchema")
            .field("schema", &self.schema)
            .finish()
    }
}

/// The compiled input and output schemas of one node.
#[derive(Debug, Default)]
pub struct NodeSchemas {
    input: Option<CompiledSchema>,
    output: Option<CompiledSchema>,
}

impl NodeSchemas {
    /// # Errors
    /// `InvalidBlueprint` when either declared schema does not compile.
    pub fn compile(node: &NodeConfig) -> Result<Self, EngineError> {
        let compile = |direction: &str, schema: Option<&Value>| {
            schema
                .map(|s| {
                    CompiledSchema::compile(s).map_err(|message| {
                        EngineError::invalid(&node.id, format!("{direction} schema: {message}"))
                    })
                })
                .transpose()
        };
        Ok(Self {
            input: compile("input", node.input_schema.as_ref())?,
            output: compile("output", node.output_schema.as_ref())?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_none() && self.output.is_none()
    }

    pub fn check_input(&self, node_id: &str, value: &Value) -> Result<(), EngineError> {
        check(node_id, "input", self.input.as_ref(), value)
    }

    pub fn check_output(&self, node_id: &str, value: &Value) -> Result<(), EngineError> {
        check(node_id, "output", self.output.as_ref(), value)
    }
}

fn check(
    node_id: &str,
    direction: &'static str,
    schema: Option<&CompiledSchema>,
    value: &Value,
) -> Result<(), EngineError> {
    match schema {
        Some(schema) => schema
            .validate(value)
            .map_err(|message| EngineError::SchemaViolation {
                node_id: node_id.to_owned(),
                direction,
                message,
            }),
        None => Ok(()),
    }
}
