//! Shared types threaded through the engine.

use std::collections::BTreeMap;

use serde_json::Value;

/// Mutable substitution context for prompt templates.
///
/// The context is the only channel through which one stage's output reaches
/// a later stage's prompt. It is owned by a single pipeline run: seeded from
/// caller-supplied values, mutated by hooks and artifact merges, discarded
/// when the run returns.
pub type ContextMap = BTreeMap<String, Value>;

/// String form of a context value for placeholder substitution.
///
/// Strings substitute without surrounding quotes; everything else uses its
/// JSON rendering.
pub fn value_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
