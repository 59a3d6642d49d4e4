// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The immutable descriptor of one tool invocation.
///
/// A `ToolCall` is snapshotted when a protected tool is invoked and is never
/// mutated afterwards; the evaluator, the approval registry and the webhook
/// payload all see the same snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Name the tool was protected under (non-empty).
    pub tool_name: String,

    /// Parameter mapping (arbitrary JSON-shaped values).
    #[serde(default)]
    pub parameters: Map<String, Value>,

    /// Identity of the calling agent, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    /// Session the call belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Free-form caller metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters,
            agent_id: None,
            session_id: None,
            metadata: None,
        }
    }

    /// Derive the parameter mapping from a tool argument value.
    ///
    /// A single object argument *is* the parameter map. An array is treated
    /// as a positional argument list and indexed `arg0, arg1, ...`. Any
    /// other non-null value becomes `arg0`.
    pub fn parameters_from(args: Value) -> Map<String, Value> {
        match args {
            Value::Object(map) => map,
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (format!("arg{}", i), v))
                .collect(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("arg0".to_string(), other);
                map
            }
        }
    }
}
