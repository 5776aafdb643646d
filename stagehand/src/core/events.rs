//! Pipeline lifecycle events for external observers.
//!
//! A single sink receives the closed set of event variants as they occur,
//! e.g. to stream progress into a UI. Delivery is fire-and-forget: an `Err`
//! from [`EventSink::emit`] is logged by the executor and never aborts the
//! run.

use anyhow::Result;
use tracing::info;

use crate::core::completion::Artifacts;
use crate::pipeline::PipelineStatus;

/// Closed set of events emitted during a pipeline run.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A stage is about to run.
    StageStarted { stage: String },
    /// One iteration inside a stage began.
    StageIteration {
        stage: String,
        iteration: u32,
        max_iterations: u32,
    },
    /// A stage finished, complete or not.
    StageCompleted {
        stage: String,
        signal: Option<String>,
        iterations: u32,
        artifacts: Artifacts,
    },
    /// The run reached a terminal status.
    PipelineCompleted {
        status: PipelineStatus,
        total_iterations: u32,
        final_signal: Option<String>,
    },
}

/// Observer for pipeline events.
pub trait EventSink {
    fn emit(&mut self, event: &PipelineEvent) -> Result<()>;
}

/// Sink that drops every event.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&mut self, _event: &PipelineEvent) -> Result<()> {
        Ok(())
    }
}

/// Sink that reports events through `tracing` at info level.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&mut self, event: &PipelineEvent) -> Result<()> {
        match event {
            PipelineEvent::StageStarted { stage } => info!(%stage, "stage started"),
            PipelineEvent::StageIteration {
                stage,
                iteration,
                max_iterations,
            } => info!(%stage, iteration, max_iterations, "stage iteration"),
            PipelineEvent::StageCompleted {
                stage,
                signal,
                iterations,
                ..
            } => info!(%stage, ?signal, iterations, "stage completed"),
            PipelineEvent::PipelineCompleted {
                status,
                total_iterations,
                final_signal,
            } => info!(?status, total_iterations, ?final_signal, "pipeline completed"),
        }
        Ok(())
    }
}
