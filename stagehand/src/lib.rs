//! Stage-driven agent pipeline engine.
//!
//! Stagehand drives a coding-agent CLI through a sequence of named stages.
//! Each stage runs the agent until its completion strategy finds a signal in
//! the captured output, then the pipeline follows the stage's transition map.
//! Artifacts extracted along the way feed later stages' prompt templates, so
//! multi-step workflows (build, review, validate) compose without any stage
//! knowing about the others. The architecture enforces a strict separation:
//!
//! - **[`core`]**: pure, deterministic logic (completion detection, event
//!   types). No I/O, fully testable in isolation.
//! - **[`io`]**: side-effecting collaborators (agent subprocesses, pipeline
//!   config files, git). Isolated behind traits to enable scripted doubles
//!   in tests.
//!
//! Orchestration modules ([`stage`], [`pipeline`], [`hooks`]) coordinate core
//! logic with I/O to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod hooks;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod stage;
pub mod stats;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
