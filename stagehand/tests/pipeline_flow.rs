//! End-to-end pipeline scenarios through the public API.

use serde_json::{Value, json};

use stagehand::core::completion::{
    Completion, CompletionResult, JsonCompletion, PromiseCompletion,
};
use stagehand::core::types::ContextMap;
use stagehand::hooks::StageHooks;
use stagehand::io::config::parse_pipeline;
use stagehand::io::template::PromptSource;
use stagehand::pipeline::{PipelineConfig, PipelineExecutor, PipelineStatus};
use stagehand::stage::StageConfig;
use stagehand::stats::UsageStats;
use stagehand::test_support::{RecordingSink, ScriptedAgent};

fn promise_stage(name: &str, prompt: &str, signals: &[&str]) -> StageConfig {
    StageConfig::new(
        name,
        PromptSource::Inline(prompt.to_string()),
        Completion::Promise(PromiseCompletion::new(
            signals.iter().map(|s| s.to_string()).collect(),
        )),
    )
}

#[test]
fn build_review_validate_flow_carries_artifacts() {
    let build = promise_stage("build", "build {tasks_file}", &["BUILD_COMPLETE"])
        .with_transition("BUILD_COMPLETE", "review");
    let review = StageConfig::new(
        "review",
        PromptSource::Inline("review the work; report goes to {report}".to_string()),
        Completion::Json(JsonCompletion::new(vec!["APPROVED".to_string()])),
    )
    .with_transition("APPROVED", "validate");
    let validate = promise_stage("validate", "validate using {report}", &["COMPLETE"]);

    let config = PipelineConfig::new("full", "build")
        .with_stage(build)
        .with_stage(review)
        .with_stage(validate)
        .with_end_signals(&["COMPLETE"]);

    let agent = ScriptedAgent::with_outputs(&[
        "all tasks done [[PROMISE:BUILD_COMPLETE]]",
        "```json\n{\"status\": \"approved\", \"report\": \"review.md\"}\n```",
        "checked against review.md [[PROMISE:COMPLETE]]",
    ]);

    let mut context = ContextMap::new();
    context.insert("tasks_file".to_string(), json!("docs/tasks.md"));

    let sink = RecordingSink::new();
    let mut executor = PipelineExecutor::new(config, agent)
        .expect("executor")
        .with_context(context)
        .with_sink(sink.clone());

    let mut stats = UsageStats::default();
    let state = executor.run(&mut stats);

    assert_eq!(state.status, PipelineStatus::Completed);
    assert_eq!(state.total_iterations, 3);
    assert_eq!(
        state.stage_history,
        vec![
            ("build".to_string(), Some("BUILD_COMPLETE".to_string())),
            ("review".to_string(), Some("APPROVED".to_string())),
            ("validate".to_string(), Some("COMPLETE".to_string())),
        ]
    );
    assert_eq!(state.global_artifacts.get("report"), Some(&json!("review.md")));
    assert_eq!(stats.iterations_completed, 3);
    assert_eq!(sink.kinds().last(), Some(&"pipeline_completed"));
}

#[test]
fn end_signal_preempts_declared_transition() {
    let config = PipelineConfig::new("precedence", "a")
        .with_stage(promise_stage("a", "a", &["DONE"]).with_transition("DONE", "b"))
        .with_stage(promise_stage("b", "b", &["NEVER"]))
        .with_end_signals(&["DONE"]);

    let agent = ScriptedAgent::with_outputs(&["[[PROMISE:DONE]]"]);
    let mut executor = PipelineExecutor::new(config, agent).expect("executor");
    let state = executor.run(&mut UsageStats::default());

    assert_eq!(state.status, PipelineStatus::Completed);
    assert_eq!(state.stage_history, vec![("a".to_string(), Some("DONE".to_string()))]);
}

#[test]
fn gaps_found_loops_back_to_build() {
    let build = promise_stage("build", "build", &["BUILD_COMPLETE"])
        .with_transition("BUILD_COMPLETE", "validate");
    let validate = StageConfig::new(
        "validate",
        PromptSource::Inline("validate; remediation at {gaps_file}".to_string()),
        Completion::Json(JsonCompletion::new(vec![
            "COMPLETE".to_string(),
            "GAPS_FOUND".to_string(),
        ])),
    )
    .with_max_iterations(1)
    .with_transition("GAPS_FOUND", "build");

    let config = PipelineConfig::new("loop", "build")
        .with_stage(build)
        .with_stage(validate)
        .with_end_signals(&["COMPLETE"]);

    let agent = ScriptedAgent::with_outputs(&[
        "[[PROMISE:BUILD_COMPLETE]]",
        "```json\n{\"status\": \"GAPS_FOUND\", \"gaps_file\": \"gaps.md\"}\n```",
        "[[PROMISE:BUILD_COMPLETE]]",
        "```json\n{\"status\": \"COMPLETE\"}\n```",
    ]);
    let mut executor = PipelineExecutor::new(config, agent).expect("executor");
    let state = executor.run(&mut UsageStats::default());

    assert_eq!(state.status, PipelineStatus::Completed);
    let stages: Vec<&str> = state.stage_history.iter().map(|(s, _)| s.as_str()).collect();
    assert_eq!(stages, vec!["build", "validate", "build", "validate"]);
    // The gaps file from the first validation pass stays in the artifacts.
    assert_eq!(state.global_artifacts.get("gaps_file"), Some(&json!("gaps.md")));
}

struct ContextSeedingHooks;

impl StageHooks for ContextSeedingHooks {
    fn before_stage(&mut self, stage: &str, context: &mut ContextMap) -> anyhow::Result<()> {
        if stage == "review" {
            context.insert(
                "changed_files".to_string(),
                Value::String("- `src/lib.rs (modified)`".to_string()),
            );
        }
        Ok(())
    }

    fn after_stage(
        &mut self,
        _stage: &str,
        _context: &mut ContextMap,
        _result: &CompletionResult,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn hook_injected_context_reaches_prompts() {
    let build = promise_stage("build", "build", &["X"]).with_transition("X", "review");
    let review = promise_stage("review", "review: {changed_files}", &["Y"]);
    let config = PipelineConfig::new("hooked", "build")
        .with_stage(build)
        .with_stage(review);

    let agent = ScriptedAgent::with_outputs(&["[[PROMISE:X]]", "[[PROMISE:Y]]"]);
    let mut executor = PipelineExecutor::new(config, agent)
        .expect("executor")
        .with_hooks(ContextSeedingHooks);

    executor.run(&mut UsageStats::default());

    // The review prompt saw the hook-injected value; the build prompt ran
    // before any injection and kept its literal text.
    let prompts = executor.agent().prompts();
    assert_eq!(prompts[0], "build");
    assert_eq!(prompts[1], "review: - `src/lib.rs (modified)`");
}

#[test]
fn unresolved_placeholder_survives_for_diagnosis() {
    let config = PipelineConfig::new("unwired", "a")
        .with_stage(promise_stage("a", "path is {not_provided}", &["X"]));
    let agent = ScriptedAgent::with_outputs(&["[[PROMISE:X]]"]);
    let mut executor = PipelineExecutor::new(config, agent).expect("executor");

    executor.run(&mut UsageStats::default());
    assert_eq!(executor.agent().prompts(), vec!["path is {not_provided}"]);
}

#[test]
fn parsed_pipeline_runs_end_to_end() {
    let contents = r#"
name = "from-toml"
start_stage = "build"
end_signals = ["COMPLETE"]

[[stages]]
name = "build"
prompt = "work on {tasks_file}"
max_iterations = 2

[stages.completion]
kind = "promise"
signals = ["BUILD_COMPLETE"]

[stages.transitions]
BUILD_COMPLETE = "validate"

[[stages]]
name = "validate"
prompt = "validate"
max_iterations = 1

[stages.completion]
kind = "json"
statuses = ["COMPLETE"]
"#;
    let config = parse_pipeline(contents, None).expect("parse");

    let agent = ScriptedAgent::with_outputs(&[
        "still going",
        "[[PROMISE:BUILD_COMPLETE]]",
        "```json\n{\"status\": \"COMPLETE\", \"summary\": \"all good\"}\n```",
    ]);
    let mut executor = PipelineExecutor::new(config, agent).expect("executor");
    let state = executor.run(&mut UsageStats::default());

    assert_eq!(state.status, PipelineStatus::Completed);
    assert_eq!(state.total_iterations, 3);
    assert_eq!(state.global_artifacts.get("summary"), Some(&json!("all good")));
}

#[test]
fn stop_handle_from_another_thread() {
    // One slow-ish stage that never completes; the stop lands between
    // iterations of the executor loop at the next stage boundary.
    let config = PipelineConfig::new("stoppable", "a").with_stage(
        promise_stage("a", "a", &["NEVER"])
            .with_max_iterations(1)
            .with_transition("ANY", "a"),
    );
    let agent = ScriptedAgent::with_outputs(&["no signal here"]);
    let mut executor = PipelineExecutor::new(config, agent).expect("executor");

    let handle = executor.stop_handle();
    let stopper = std::thread::spawn(move || handle.stop());
    stopper.join().expect("stopper thread");

    let state = executor.run(&mut UsageStats::default());
    assert_eq!(state.status, PipelineStatus::Stopped);
    assert!(state.stage_history.is_empty());
}
