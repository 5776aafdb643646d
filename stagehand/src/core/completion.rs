//! Completion detection for pipeline stages.
//!
//! A stage is done when its completion strategy finds a signal in the agent's
//! captured output. Strategies are pure: the same `(output, exit_code)` pair
//! always yields the same verdict, which keeps re-evaluation and tests
//! deterministic. Parse failures never escape as errors; they degrade to a
//! non-complete verdict so the stage loop can keep iterating.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Key-value artifacts extracted from agent output.
pub type Artifacts = BTreeMap<String, Value>;

/// Verdict from evaluating stage output.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResult {
    /// Whether the stage should be considered complete.
    pub is_complete: bool,
    /// Signal detected in the output (e.g. "BUILD_COMPLETE"), if any. A
    /// non-complete result may still carry a signal for diagnostics.
    pub signal: Option<String>,
    /// Artifacts extracted from the output.
    pub artifacts: Artifacts,
}

impl CompletionResult {
    /// Non-complete result with no signal and no artifacts.
    pub fn incomplete() -> Self {
        Self {
            is_complete: false,
            signal: None,
            artifacts: Artifacts::new(),
        }
    }
}

static PROMISE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\[\[PROMISE:(.*?)\]\]").unwrap());

static JSON_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json[ \t]*\n(.*?)\n```").unwrap());

/// Detects completion via `[[PROMISE:SIGNAL]]` tags in the output.
///
/// Tags are matched non-greedily and may span lines. Signal comparison is
/// exact: tags are upper-case by convention but nothing here enforces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromiseCompletion {
    /// Signals that count as completion.
    pub complete_signals: Vec<String>,
    /// Withhold completion when the process exited non-zero.
    pub require_success: bool,
    /// Pull artifacts from a trailing fenced JSON block.
    pub extract_artifacts: bool,
}

impl PromiseCompletion {
    pub fn new(complete_signals: Vec<String>) -> Self {
        Self {
            complete_signals,
            require_success: false,
            extract_artifacts: false,
        }
    }

    fn evaluate(&self, output: &str, exit_code: i32) -> CompletionResult {
        let signals: Vec<String> = PROMISE_RE
            .captures_iter(output)
            .map(|caps| caps[1].trim().to_string())
            .collect();

        let mut artifacts = if self.extract_artifacts {
            last_json_object(output)
                .map(|map| map.into_iter().collect())
                .unwrap_or_default()
        } else {
            Artifacts::new()
        };

        // The last tag in the complete set wins; earlier matches may be
        // progress markers from intermediate turns.
        let completing = signals
            .iter()
            .rev()
            .find(|signal| self.complete_signals.contains(signal));

        if let Some(signal) = completing {
            if self.require_success && exit_code != 0 {
                artifacts.insert("exit_code".to_string(), Value::from(exit_code));
                return CompletionResult {
                    is_complete: false,
                    signal: Some(signal.clone()),
                    artifacts,
                };
            }
            return CompletionResult {
                is_complete: true,
                signal: Some(signal.clone()),
                artifacts,
            };
        }

        CompletionResult {
            is_complete: false,
            signal: signals.last().cloned(),
            artifacts,
        }
    }
}

/// Detects completion via the last fenced ```json block in the output.
///
/// Later blocks override earlier ones: the agent's final word wins. The
/// signal is read from a configurable field and upper-cased before set
/// membership, so status comparison is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonCompletion {
    /// Status values that count as completion (upper-case).
    pub complete_statuses: Vec<String>,
    /// Object field holding the signal (default "status").
    pub signal_field: String,
    /// Fields to copy into artifacts; `None` takes every field except the
    /// signal field.
    pub artifact_fields: Option<Vec<String>>,
    /// Withhold completion when the process exited non-zero.
    pub require_success: bool,
}

impl JsonCompletion {
    pub fn new(complete_statuses: Vec<String>) -> Self {
        Self {
            complete_statuses,
            signal_field: "status".to_string(),
            artifact_fields: None,
            require_success: false,
        }
    }

    fn evaluate(&self, output: &str, exit_code: i32) -> CompletionResult {
        let Some(data) = last_json_object(output) else {
            return CompletionResult::incomplete();
        };

        let signal = data
            .get(&self.signal_field)
            .and_then(Value::as_str)
            .map(str::to_uppercase);

        let mut artifacts: Artifacts = match &self.artifact_fields {
            Some(fields) => fields
                .iter()
                .filter_map(|key| data.get(key).map(|value| (key.clone(), value.clone())))
                .collect(),
            None => data
                .into_iter()
                .filter(|(key, _)| *key != self.signal_field)
                .collect(),
        };

        let mut is_complete = signal
            .as_deref()
            .is_some_and(|s| self.complete_statuses.iter().any(|c| c == s));

        if is_complete && self.require_success && exit_code != 0 {
            is_complete = false;
            artifacts.insert("exit_code".to_string(), Value::from(exit_code));
        }

        CompletionResult {
            is_complete,
            signal,
            artifacts,
        }
    }
}

/// Ordered fallback over multiple strategies.
///
/// The first strategy reporting completion wins. When none complete, the
/// LAST strategy's result is returned, so a caller can put the canonical
/// strategy first and still surface the fallback's diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeCompletion {
    pub strategies: Vec<Completion>,
}

impl CompositeCompletion {
    fn evaluate(&self, output: &str, exit_code: i32) -> CompletionResult {
        // An empty list is rejected at config time; evaluating one anyway
        // degrades to a plain non-complete result.
        let mut last = CompletionResult::incomplete();
        for strategy in &self.strategies {
            let result = strategy.evaluate(output, exit_code);
            if result.is_complete {
                return result;
            }
            last = result;
        }
        last
    }
}

/// Closed set of completion strategies, selected at pipeline build time.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Promise(PromiseCompletion),
    Json(JsonCompletion),
    Composite(CompositeCompletion),
}

impl Completion {
    /// Evaluate stage output. Pure: equal inputs yield equal results.
    pub fn evaluate(&self, output: &str, exit_code: i32) -> CompletionResult {
        match self {
            Self::Promise(promise) => promise.evaluate(output, exit_code),
            Self::Json(json) => json.evaluate(output, exit_code),
            Self::Composite(composite) => composite.evaluate(output, exit_code),
        }
    }
}

/// Parse the last fenced ```json block as an object.
///
/// Returns `None` when no block exists, the block is malformed, or it parses
/// to something other than an object.
fn last_json_object(output: &str) -> Option<serde_json::Map<String, Value>> {
    let caps = JSON_BLOCK_RE.captures_iter(output).last()?;
    let raw = caps.get(1)?.as_str().trim();
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}
