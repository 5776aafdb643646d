//! Stage lifecycle hooks.
//!
//! Hooks are injection points the executor calls around each stage run. They
//! mutate the shared context in place; the executor consumes no return
//! value. An `Err` from a hook fails the run: a half-applied context
//! mutation means the next prompt would be built from wrong inputs, which is
//! a configuration bug worth stopping for (see DESIGN.md).

use anyhow::Result;
use serde_json::Value;
use tracing::{info, warn};

use crate::core::completion::CompletionResult;
use crate::core::types::ContextMap;
use crate::io::git::Git;

/// Callbacks invoked around each stage run. Both default to no-ops.
pub trait StageHooks {
    /// Called before a stage runs; may mutate the context in place.
    fn before_stage(&mut self, stage: &str, context: &mut ContextMap) -> Result<()> {
        let _ = (stage, context);
        Ok(())
    }

    /// Called after a stage finishes, before its artifacts merge into the
    /// context; may mutate the context in place.
    fn after_stage(
        &mut self,
        stage: &str,
        context: &mut ContextMap,
        result: &CompletionResult,
    ) -> Result<()> {
        let _ = (stage, context, result);
        Ok(())
    }
}

/// Context key holding the HEAD snapshot taken before the build stage.
const START_COMMIT_KEY: &str = "_stage_start_commit";

/// Hooks that capture what changed on disk during a build stage and expose
/// `changed_files` / `commit_messages` to the following review prompt.
///
/// Git being unavailable is tolerated with fallback context values rather
/// than failing the run; review prompts degrade gracefully without a diff.
pub struct DiffHooks {
    git: Git,
    build_stage: String,
}

impl DiffHooks {
    pub fn new(git: Git, build_stage: impl Into<String>) -> Self {
        Self {
            git,
            build_stage: build_stage.into(),
        }
    }
}

impl StageHooks for DiffHooks {
    fn before_stage(&mut self, stage: &str, context: &mut ContextMap) -> Result<()> {
        if stage != self.build_stage {
            return Ok(());
        }
        match self.git.head_short_sha() {
            Ok(head) => {
                info!(%head, "snapshotted HEAD before build stage");
                context.insert(START_COMMIT_KEY.to_string(), Value::String(head));
            }
            Err(err) => warn!(error = %err, "could not snapshot HEAD before build stage"),
        }
        Ok(())
    }

    fn after_stage(
        &mut self,
        stage: &str,
        context: &mut ContextMap,
        _result: &CompletionResult,
    ) -> Result<()> {
        if stage != self.build_stage {
            return Ok(());
        }

        let start = context
            .get(START_COMMIT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(start) = start else {
            warn!("no start commit captured; skipping diff collection");
            set_diff_context(
                context,
                "No files changed (no start commit captured)",
                "No commits (no start commit captured)",
            );
            return Ok(());
        };

        match self.git.collect_diff(&start) {
            Ok(diff) => {
                info!(
                    files = diff.changed_files.len(),
                    commits = diff.commit_messages.len(),
                    start = %diff.start_commit,
                    end = %diff.end_commit,
                    "collected build diff"
                );
                let files = diff.format_file_list();
                let commits = diff.format_commits();
                set_diff_context(context, &files, &commits);
            }
            Err(err) => {
                warn!(error = %err, "failed to collect diff");
                set_diff_context(context, "No files changed", "No commits");
            }
        }
        Ok(())
    }
}

fn set_diff_context(context: &mut ContextMap, files: &str, commits: &str) {
    context.insert(
        "changed_files".to_string(),
        Value::String(files.to_string()),
    );
    context.insert(
        "commit_messages".to_string(),
        Value::String(commits.to_string()),
    );
}
