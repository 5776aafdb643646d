//! Multi-stage pipeline orchestration.
//!
//! The executor drives a pipeline from its start stage to a terminal status,
//! one stage at a time, following each stage's transition map. Stage
//! artifacts accumulate into a run-wide map and merge into the shared
//! context so later prompts can see them. Ordinary stage and agent failures
//! never surface as errors from [`PipelineExecutor::run`]; the returned
//! state's `status` and `stage_history` carry the outcome.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::core::completion::{Artifacts, Completion};
use crate::core::events::{EventSink, NullSink, PipelineEvent};
use crate::core::types::ContextMap;
use crate::hooks::StageHooks;
use crate::io::agent::AgentRunner;
use crate::stage::{Stage, StageConfig};
use crate::stats::UsageStats;

/// Status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

/// Immutable definition of a complete pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub name: String,
    /// Stage definitions keyed by stage name.
    pub stages: BTreeMap<String, StageConfig>,
    /// Name of the stage the run begins with.
    pub start_stage: String,
    /// Signals that terminate the pipeline regardless of transition maps.
    pub end_signals: Vec<String>,
}

impl PipelineConfig {
    pub fn new(name: impl Into<String>, start_stage: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: BTreeMap::new(),
            start_stage: start_stage.into(),
            end_signals: Vec::new(),
        }
    }

    /// Add a stage definition, keyed by its name.
    pub fn with_stage(mut self, stage: StageConfig) -> Self {
        self.stages.insert(stage.name.clone(), stage);
        self
    }

    pub fn with_end_signals(mut self, signals: &[&str]) -> Self {
        self.end_signals = signals.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Check cross-references before anything runs.
    ///
    /// Rejects an empty stage set, an unknown start stage, transitions to
    /// undeclared stages, non-positive iteration budgets, and empty
    /// composite strategy lists.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(anyhow!("pipeline '{}' declares no stages", self.name));
        }
        if !self.stages.contains_key(&self.start_stage) {
            return Err(anyhow!(
                "start stage '{}' not found in pipeline '{}'",
                self.start_stage,
                self.name
            ));
        }
        for (name, stage) in &self.stages {
            if stage.name != *name {
                return Err(anyhow!(
                    "stage key '{name}' does not match stage name '{}'",
                    stage.name
                ));
            }
            if stage.max_iterations == 0 {
                return Err(anyhow!("stage '{name}': max_iterations must be > 0"));
            }
            for (signal, target) in &stage.transitions {
                if !self.stages.contains_key(target) {
                    return Err(anyhow!(
                        "stage '{name}' transition '{signal}' -> '{target}': target stage not found"
                    ));
                }
            }
            validate_completion(name, &stage.completion)?;
        }
        Ok(())
    }
}

fn validate_completion(stage: &str, completion: &Completion) -> Result<()> {
    if let Completion::Composite(composite) = completion {
        if composite.strategies.is_empty() {
            return Err(anyhow!(
                "stage '{stage}': composite completion requires at least one strategy"
            ));
        }
        for inner in &composite.strategies {
            validate_completion(stage, inner)?;
        }
    }
    Ok(())
}

/// Mutable state of one pipeline run, returned to the caller at the end.
#[derive(Debug, Clone)]
pub struct PipelineState {
    /// Stage currently executing, or the last one executed.
    pub current_stage: Option<String>,
    /// Artifacts accumulated across all stages; a later stage's same-named
    /// artifact overwrites an earlier one. Keys are never removed mid-run.
    pub global_artifacts: Artifacts,
    pub status: PipelineStatus,
    /// Exact path taken, one `(stage, signal)` entry per stage run,
    /// including repeated visits to the same stage.
    pub stage_history: Vec<(String, Option<String>)>,
    /// Iterations consumed across all stages.
    pub total_iterations: u32,
}

impl PipelineState {
    fn new() -> Self {
        Self {
            current_stage: None,
            global_artifacts: Artifacts::new(),
            status: PipelineStatus::Pending,
            stage_history: Vec::new(),
            total_iterations: 0,
        }
    }
}

/// Cloneable handle requesting a cooperative stop.
///
/// The request is honored at the next stage boundary; an in-flight agent
/// invocation is never interrupted. Safe to call from another thread, and
/// idempotent.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drives a pipeline from its start stage to a terminal status.
///
/// Stages run strictly one after another within a run, and `&mut self` on
/// [`PipelineExecutor::run`] statically prevents two concurrent runs of the
/// same instance.
pub struct PipelineExecutor<A> {
    config: PipelineConfig,
    agent: A,
    stages: BTreeMap<String, Stage>,
    initial_context: ContextMap,
    hooks: Option<Box<dyn StageHooks>>,
    sink: Box<dyn EventSink>,
    stop: StopHandle,
}

impl<A: AgentRunner> PipelineExecutor<A> {
    /// Build an executor, validating the configuration first.
    pub fn new(config: PipelineConfig, agent: A) -> Result<Self> {
        config.validate()?;
        let stages = config
            .stages
            .iter()
            .map(|(name, stage_config)| (name.clone(), Stage::new(stage_config.clone())))
            .collect();
        Ok(Self {
            config,
            agent,
            stages,
            initial_context: ContextMap::new(),
            hooks: None,
            sink: Box::new(NullSink),
            stop: StopHandle::default(),
        })
    }

    /// Seed the execution context with initial variables.
    pub fn with_context(mut self, context: ContextMap) -> Self {
        self.initial_context = context;
        self
    }

    /// Install lifecycle hooks called around each stage.
    pub fn with_hooks(mut self, hooks: impl StageHooks + 'static) -> Self {
        self.hooks = Some(Box::new(hooks));
        self
    }

    /// Install an event sink for run observation.
    pub fn with_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Handle for requesting a cooperative stop, e.g. from a signal handler.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// The agent backend this executor drives.
    pub fn agent(&self) -> &A {
        &self.agent
    }

    fn emit(sink: &mut dyn EventSink, event: &PipelineEvent) {
        // Event delivery failures never abort the run.
        if let Err(err) = sink.emit(event) {
            warn!(error = %err, "event sink failed");
        }
    }

    /// Execute the pipeline to a terminal status.
    ///
    /// A stop requested through the [`StopHandle`] wins over whatever the
    /// loop would otherwise have produced. A hook returning an error fails
    /// the run (see DESIGN.md for the rationale).
    pub fn run(&mut self, stats: &mut UsageStats) -> PipelineState {
        let mut state = PipelineState::new();
        state.status = PipelineStatus::Running;

        let mut context = self.initial_context.clone();
        let mut current = Some(self.config.start_stage.clone());
        let mut final_signal: Option<String> = None;

        info!(
            pipeline = %self.config.name,
            start_stage = %self.config.start_stage,
            "pipeline starting"
        );

        while let Some(stage_name) = current.take() {
            if self.stop.is_stopped() {
                state.status = PipelineStatus::Stopped;
                break;
            }

            // Construction-time validation makes this unreachable through
            // declared transitions.
            let Some(stage) = self.stages.get(&stage_name) else {
                error!(stage = %stage_name, "unknown stage reached at runtime");
                state.status = PipelineStatus::Failed;
                break;
            };
            state.current_stage = Some(stage_name.clone());

            if let Some(hooks) = self.hooks.as_mut()
                && let Err(err) = hooks.before_stage(&stage_name, &mut context)
            {
                error!(stage = %stage_name, error = %err, "before-stage hook failed");
                state.status = PipelineStatus::Failed;
                break;
            }

            Self::emit(
                self.sink.as_mut(),
                &PipelineEvent::StageStarted {
                    stage: stage_name.clone(),
                },
            );

            let sink = self.sink.as_mut();
            let outcome = stage.run(&self.agent, &context, stats, |iteration, max_iterations| {
                Self::emit(
                    sink,
                    &PipelineEvent::StageIteration {
                        stage: stage_name.clone(),
                        iteration,
                        max_iterations,
                    },
                );
            });

            let (result, iterations) = match outcome {
                Ok(pair) => pair,
                Err(err) => {
                    error!(stage = %stage_name, error = %err, "stage execution failed");
                    state.status = PipelineStatus::Failed;
                    break;
                }
            };

            state.total_iterations += iterations;
            for (key, value) in &result.artifacts {
                state.global_artifacts.insert(key.clone(), value.clone());
            }
            state
                .stage_history
                .push((stage_name.clone(), result.signal.clone()));

            if let Some(hooks) = self.hooks.as_mut()
                && let Err(err) = hooks.after_stage(&stage_name, &mut context, &result)
            {
                error!(stage = %stage_name, error = %err, "after-stage hook failed");
                state.status = PipelineStatus::Failed;
                break;
            }

            Self::emit(
                self.sink.as_mut(),
                &PipelineEvent::StageCompleted {
                    stage: stage_name.clone(),
                    signal: result.signal.clone(),
                    iterations,
                    artifacts: result.artifacts.clone(),
                },
            );

            // An end signal terminates the run even when the stage also
            // declares a transition for it.
            if let Some(signal) = &result.signal
                && self.config.end_signals.iter().any(|s| s == signal)
            {
                info!(pipeline = %self.config.name, %signal, "pipeline reached end signal");
                final_signal = Some(signal.clone());
                state.status = PipelineStatus::Completed;
                break;
            }

            match stage.next_stage(&result) {
                Some(next) => {
                    info!(
                        from = %stage_name,
                        to = %next,
                        signal = ?result.signal,
                        "transitioning"
                    );
                    let next = next.to_string();
                    // Merge after the after-hook ran: a same-named stage
                    // artifact overwrites a hook-written key by contract.
                    for (key, value) in result.artifacts {
                        context.insert(key, value);
                    }
                    current = Some(next);
                }
                None if result.is_complete => {
                    info!(
                        stage = %stage_name,
                        signal = ?result.signal,
                        "stage complete with no transition; pipeline done"
                    );
                    final_signal = result.signal.clone();
                    state.status = PipelineStatus::Completed;
                    break;
                }
                None => {
                    warn!(
                        stage = %stage_name,
                        signal = ?result.signal,
                        "stage gave up without a transition; pipeline failed"
                    );
                    state.status = PipelineStatus::Failed;
                    break;
                }
            }
        }

        // A stop request wins over whatever the loop produced.
        if self.stop.is_stopped() {
            state.status = PipelineStatus::Stopped;
        }

        Self::emit(
            self.sink.as_mut(),
            &PipelineEvent::PipelineCompleted {
                status: state.status,
                total_iterations: state.total_iterations,
                final_signal,
            },
        );

        state
    }
}
