//! Test-only doubles for agent backends and event sinks.

use std::cell::RefCell;
use std::rc::Rc;

use crate::core::events::{EventSink, PipelineEvent};
use crate::io::agent::{AgentError, AgentReply, AgentRequest, AgentRunner};
use crate::stats::UsageStats;

/// One scripted behavior for a [`ScriptedAgent`].
#[derive(Debug)]
pub enum ScriptedReply {
    /// Return a normal reply.
    Reply { exit_code: i32, output: String },
    /// Fail at the invocation layer.
    Fail(AgentError),
}

impl ScriptedReply {
    pub fn reply(exit_code: i32, output: &str) -> Self {
        Self::Reply {
            exit_code,
            output: output.to_string(),
        }
    }
}

/// Agent double that returns queued replies in order and records prompts.
///
/// Once the queue is drained, further calls return an empty successful reply,
/// which no completion strategy treats as complete.
#[derive(Debug)]
pub struct ScriptedAgent {
    replies: RefCell<Vec<ScriptedReply>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: RefCell::new(replies),
            prompts: RefCell::new(Vec::new()),
        }
    }

    /// Scripted agent answering each call with the next output, exit code 0.
    pub fn with_outputs(outputs: &[&str]) -> Self {
        Self::new(
            outputs
                .iter()
                .map(|output| ScriptedReply::reply(0, output))
                .collect(),
        )
    }

    /// Number of invocations so far.
    pub fn calls(&self) -> usize {
        self.prompts.borrow().len()
    }

    /// Prompts received, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl AgentRunner for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    fn run_prompt(
        &self,
        request: &AgentRequest<'_>,
        _stats: &mut UsageStats,
    ) -> Result<AgentReply, AgentError> {
        self.prompts.borrow_mut().push(request.prompt.clone());
        let mut replies = self.replies.borrow_mut();
        if replies.is_empty() {
            return Ok(AgentReply {
                exit_code: 0,
                output: String::new(),
                stderr: String::new(),
            });
        }
        match replies.remove(0) {
            ScriptedReply::Reply { exit_code, output } => Ok(AgentReply {
                exit_code,
                output,
                stderr: String::new(),
            }),
            ScriptedReply::Fail(err) => Err(err),
        }
    }
}

/// Sink that records every event for assertions.
///
/// Clones share the same buffer, so a test can keep a handle while the
/// executor owns the sink.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Rc<RefCell<Vec<PipelineEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.borrow().clone()
    }

    /// Short tags of recorded events, for order assertions.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events
            .borrow()
            .iter()
            .map(|event| match event {
                PipelineEvent::StageStarted { .. } => "stage_started",
                PipelineEvent::StageIteration { .. } => "stage_iteration",
                PipelineEvent::StageCompleted { .. } => "stage_completed",
                PipelineEvent::PipelineCompleted { .. } => "pipeline_completed",
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&mut self, event: &PipelineEvent) -> anyhow::Result<()> {
        self.events.borrow_mut().push(event.clone());
        Ok(())
    }
}
