//! Single-stage execution: the agent iteration loop.
//!
//! A stage owns a prompt template, a completion strategy, and a transition
//! map. Running it means invoking the agent repeatedly, rebuilding the
//! prompt from the current context each time, until the strategy reports
//! completion or the iteration budget runs out. The stage never mutates the
//! context itself; propagating artifacts between iterations or stages is the
//! pipeline layer's job.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use anyhow::Result;
use serde_json::Value;
use tracing::{info, warn};

use crate::core::completion::{Completion, CompletionResult};
use crate::core::types::ContextMap;
use crate::io::agent::{AgentRequest, AgentRunner};
use crate::io::template::{PromptSource, substitute};
use crate::stats::UsageStats;

/// Default iteration budget for a stage.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Immutable definition of one pipeline stage.
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Unique key within the pipeline (e.g. "build", "code_review").
    pub name: String,
    /// Prompt template source.
    pub prompt: PromptSource,
    /// How to detect that this stage is done.
    pub completion: Completion,
    /// Iteration budget; the loop never runs more than this many times.
    pub max_iterations: u32,
    /// Signal-to-stage transitions (e.g. "BUILD_COMPLETE" -> "code_review").
    pub transitions: BTreeMap<String, String>,
    /// Tool allowlist forwarded opaquely to the agent backend.
    pub allowed_tools: Option<Vec<String>>,
    /// Tool denylist forwarded opaquely to the agent backend.
    pub denied_tools: Option<Vec<String>>,
}

impl StageConfig {
    pub fn new(name: impl Into<String>, prompt: PromptSource, completion: Completion) -> Self {
        Self {
            name: name.into(),
            prompt,
            completion,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            transitions: BTreeMap::new(),
            allowed_tools: None,
            denied_tools: None,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Add one signal -> stage transition.
    pub fn with_transition(mut self, signal: impl Into<String>, target: impl Into<String>) -> Self {
        self.transitions.insert(signal.into(), target.into());
        self
    }
}

/// Executes a single stage to completion or iteration exhaustion.
pub struct Stage {
    config: StageConfig,
    template: OnceLock<String>,
}

impl Stage {
    pub fn new(config: StageConfig) -> Self {
        Self {
            config,
            template: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Load the prompt template, reading the backing file at most once for
    /// the life of this instance.
    fn template(&self) -> Result<&str> {
        if let Some(cached) = self.template.get() {
            return Ok(cached);
        }
        let loaded = self.config.prompt.load()?;
        Ok(self.template.get_or_init(|| loaded))
    }

    /// Build the prompt by substituting `{key}` placeholders from the
    /// context. Keys missing from the context are left in place.
    pub fn build_prompt(&self, context: &ContextMap) -> Result<String> {
        Ok(substitute(self.template()?, context))
    }

    /// Run the stage until completion or iteration exhaustion.
    ///
    /// Returns the final verdict and the number of iterations consumed. An
    /// invocation-layer failure (agent binary missing, timeout) stops the
    /// loop at once with the error captured in an `error` artifact; retry
    /// policy stays with the caller. A template that cannot be loaded is the
    /// only `Err` this returns.
    pub fn run<A: AgentRunner>(
        &self,
        agent: &A,
        context: &ContextMap,
        stats: &mut UsageStats,
        mut on_iteration: impl FnMut(u32, u32),
    ) -> Result<(CompletionResult, u32)> {
        let mut iterations = 0u32;
        let mut last = CompletionResult::incomplete();

        while iterations < self.config.max_iterations {
            iterations += 1;
            on_iteration(iterations, self.config.max_iterations);
            info!(
                stage = %self.config.name,
                iteration = iterations,
                max_iterations = self.config.max_iterations,
                "running stage iteration"
            );

            // Rebuild from the current context: hooks may have changed it
            // between iterations at the pipeline level.
            let prompt = self.build_prompt(context)?;
            let request = AgentRequest {
                prompt,
                allowed_tools: self.config.allowed_tools.as_deref(),
                denied_tools: self.config.denied_tools.as_deref(),
            };

            let reply = match agent.run_prompt(&request, stats) {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(stage = %self.config.name, error = %err, "agent invocation failed");
                    stats.iterations_failed += 1;
                    let mut result = CompletionResult::incomplete();
                    result
                        .artifacts
                        .insert("error".to_string(), Value::String(err.to_string()));
                    return Ok((result, iterations));
                }
            };

            last = self.config.completion.evaluate(&reply.output, reply.exit_code);

            if last.is_complete {
                stats.iterations_completed += 1;
                info!(stage = %self.config.name, signal = ?last.signal, "stage complete");
                return Ok((last, iterations));
            }
            match &last.signal {
                Some(signal) => {
                    info!(stage = %self.config.name, %signal, "not complete yet, continuing");
                }
                None => info!(stage = %self.config.name, "no completion signal, continuing"),
            }
        }

        warn!(
            stage = %self.config.name,
            max_iterations = self.config.max_iterations,
            "iteration budget exhausted without completion"
        );
        Ok((last, iterations))
    }

    /// Look up the next stage for the result's signal, if any.
    pub fn next_stage(&self, result: &CompletionResult) -> Option<&str> {
        let signal = result.signal.as_ref()?;
        self.config.transitions.get(signal).map(String::as_str)
    }
}
