//! Tool argument validation against compiled JSON schemas
use jsonschema::JSONSchema;
use log::debug;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::cache::{CachePolicy, LookupCache, PopulateError};
use crate::error::{GatewayError, ResourceKind, Violation};
use crate::model::{Deployment, ToolDefinition};

/// Failure to build a tool schema
#[derive(Debug, Clone, Error)]
pub enum SchemaError {
    #[error("tool '{tool}' schema does not compile: {reason}")]
    Invalid { tool: String, reason: String },
    #[error("schema build interrupted: {0}")]
    Interrupted(String),
}

impl PopulateError for SchemaError {
    fn is_transient(&self) -> bool {
        false
    }

    fn interrupted(reason: String) -> Self {
        SchemaError::Interrupted(reason)
    }
}

/// Validated tool-call arguments
#[derive(Debug, Clone, PartialEq)]
pub struct ToolArguments(Value);

impl ToolArguments {
    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

/// Compiled, immutable schema of one tool
pub struct ToolSchema {
    validator: Option<JSONSchema>,
}

impl ToolSchema {
    pub fn compile(definition: &ToolDefinition) -> Result<Self, SchemaError> {
        let validator = match &definition.input_schema {
            Some(schema) => Some(JSONSchema::options().compile(schema).map_err(|e| {
                SchemaError::Invalid {
                    tool: definition.name.clone(),
                    reason: e.to_string(),
                }
            })?),
            None => None,
        };
        Ok(Self { validator })
    }

    /// Every violation of `args`, in validator order
    pub fn violations(&self, args: &Value) -> Vec<Violation> {
        let Some(validator) = &self.validator else {
            return Vec::new();
        };
        match validator.validate(args) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|error| Violation {
                    path: error.instance_path.to_string(),
                    message: error.to_string(),
                })
                .collect(),
        }
    }
}

/// Schema key; a new deployment version yields a new key
pub fn schema_key(deployment: &Deployment, tool_name: &str) -> String {
    format!("{}@{}/{}", deployment.id, deployment.version, tool_name)
}

/// Validates tool arguments, compiling each schema once per key
pub struct SchemaRegistry {
    schemas: LookupCache<Arc<ToolSchema>, SchemaError>,
}

impl SchemaRegistry {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            schemas: LookupCache::new("schemas", policy),
        }
    }

    /// Check `args` against the schema of `tool_name` in `deployment`
    pub async fn validate(
        &self,
        deployment: &Deployment,
        tool_name: &str,
        args: Value,
    ) -> Result<ToolArguments, GatewayError> {
        let key = schema_key(deployment, tool_name);
        let definition = deployment.tool(tool_name).cloned();

        let lookup = self
            .schemas
            .get(&key, move || {
                let definition = definition.clone();
                async move {
                    match definition {
                        Some(definition) => {
                            ToolSchema::compile(&definition).map(|schema| Some(Arc::new(schema)))
                        }
                        None => Ok(None),
                    }
                }
            })
            .await
            .map_err(|err| match err {
                SchemaError::Invalid { tool, reason } => {
                    GatewayError::InvalidToolSchema { tool, reason }
                }
                SchemaError::Interrupted(reason) => GatewayError::InvalidToolSchema {
                    tool: tool_name.to_string(),
                    reason,
                },
            })?;

        let schema = lookup.value.ok_or_else(|| GatewayError::NotFound {
            kind: ResourceKind::Tool,
            id: tool_name.to_string(),
        })?;

        let violations = schema.violations(&args);
        if !violations.is_empty() {
            debug!(
                "Arguments for {} rejected with {} violation(s)",
                key,
                violations.len()
            );
            return Err(GatewayError::Validation { violations });
        }
        Ok(ToolArguments(args))
    }

    pub fn cached_schemas(&self) -> u64 {
        self.schemas.len()
    }
}
