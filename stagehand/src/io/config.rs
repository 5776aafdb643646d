//! Pipeline definitions loaded from TOML files.
//!
//! The file schema mirrors the engine's configuration surface: a pipeline
//! header plus one `[[stages]]` table per stage, each with a tagged
//! completion descriptor. Everything is validated before any stage runs;
//! a bad start stage or transition target is rejected here, never at run
//! time.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::core::completion::{
    Completion, CompositeCompletion, JsonCompletion, PromiseCompletion,
};
use crate::io::template::PromptSource;
use crate::pipeline::PipelineConfig;
use crate::stage::{DEFAULT_MAX_ITERATIONS, StageConfig};

/// On-disk pipeline definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineFile {
    name: String,
    #[serde(default)]
    #[allow(dead_code)]
    description: String,
    start_stage: String,
    #[serde(default)]
    end_signals: Vec<String>,
    stages: Vec<StageEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct StageEntry {
    name: String,
    /// Path to a template file, resolved against the pipeline file's
    /// directory when relative. Exactly one of `prompt_file` / `prompt`.
    prompt_file: Option<PathBuf>,
    /// Inline template text.
    prompt: Option<String>,
    completion: CompletionSpec,
    #[serde(default = "default_max_iterations")]
    max_iterations: u32,
    #[serde(default)]
    transitions: BTreeMap<String, String>,
    allowed_tools: Option<Vec<String>>,
    denied_tools: Option<Vec<String>>,
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_signal_field() -> String {
    "status".to_string()
}

/// Tagged completion descriptor (`kind = "promise" | "json" | "composite"`).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum CompletionSpec {
    Promise {
        signals: Vec<String>,
        #[serde(default)]
        require_success: bool,
        #[serde(default)]
        extract_artifacts: bool,
    },
    Json {
        statuses: Vec<String>,
        #[serde(default = "default_signal_field")]
        signal_field: String,
        artifact_fields: Option<Vec<String>>,
        #[serde(default)]
        require_success: bool,
    },
    Composite {
        strategies: Vec<CompletionSpec>,
    },
}

impl CompletionSpec {
    fn into_completion(self, stage: &str) -> Result<Completion> {
        match self {
            Self::Promise {
                signals,
                require_success,
                extract_artifacts,
            } => {
                if signals.is_empty() {
                    bail!("stage '{stage}': promise completion needs at least one signal");
                }
                Ok(Completion::Promise(PromiseCompletion {
                    complete_signals: signals,
                    require_success,
                    extract_artifacts,
                }))
            }
            Self::Json {
                statuses,
                signal_field,
                artifact_fields,
                require_success,
            } => {
                if statuses.is_empty() {
                    bail!("stage '{stage}': json completion needs at least one status");
                }
                Ok(Completion::Json(JsonCompletion {
                    complete_statuses: statuses,
                    signal_field,
                    artifact_fields,
                    require_success,
                }))
            }
            Self::Composite { strategies } => {
                if strategies.is_empty() {
                    bail!("stage '{stage}': composite completion requires at least one strategy");
                }
                Ok(Completion::Composite(CompositeCompletion {
                    strategies: strategies
                        .into_iter()
                        .map(|spec| spec.into_completion(stage))
                        .collect::<Result<_>>()?,
                }))
            }
        }
    }
}

impl StageEntry {
    fn into_config(self, base: Option<&Path>) -> Result<StageConfig> {
        let prompt = match (self.prompt_file, self.prompt) {
            (Some(path), None) => {
                let resolved = match base {
                    Some(base) if path.is_relative() => base.join(path),
                    _ => path,
                };
                PromptSource::File(resolved)
            }
            (None, Some(text)) => PromptSource::Inline(text),
            _ => bail!(
                "stage '{}': exactly one of 'prompt_file' or 'prompt' is required",
                self.name
            ),
        };

        let completion = self.completion.into_completion(&self.name)?;
        Ok(StageConfig {
            name: self.name,
            prompt,
            completion,
            max_iterations: self.max_iterations,
            transitions: self.transitions,
            allowed_tools: self.allowed_tools,
            denied_tools: self.denied_tools,
        })
    }
}

/// Parse a pipeline definition from TOML text.
///
/// `base` is the directory relative prompt paths resolve against. The
/// returned configuration has passed [`PipelineConfig::validate`].
pub fn parse_pipeline(contents: &str, base: Option<&Path>) -> Result<PipelineConfig> {
    let file: PipelineFile = toml::from_str(contents).context("parse pipeline toml")?;

    let mut stages = BTreeMap::new();
    for entry in file.stages {
        let name = entry.name.clone();
        if stages.contains_key(&name) {
            bail!("duplicate stage name '{name}'");
        }
        stages.insert(name, entry.into_config(base)?);
    }

    let config = PipelineConfig {
        name: file.name,
        stages,
        start_stage: file.start_stage,
        end_signals: file.end_signals,
    };
    config.validate()?;
    Ok(config)
}

/// Load a pipeline definition from a TOML file.
pub fn load_pipeline(path: &Path) -> Result<PipelineConfig> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_pipeline(&contents, path.parent())
        .with_context(|| format!("invalid pipeline {}", path.display()))
}

const BUILD_PROMPT: &str = include_str!("../prompts/build.md");
const REVIEW_PROMPT: &str = include_str!("../prompts/review.md");
const VALIDATE_PROMPT: &str = include_str!("../prompts/validate.md");

// Tools the build stage may use without prompting; interactive and web tools
// are denied so an unattended loop cannot hang on them.
const BUILD_ALLOWED_TOOLS: &[&str] = &[
    "Bash", "Read", "Write", "Edit", "Glob", "Grep", "TodoRead", "TodoWrite", "Task",
];
const BUILD_DENIED_TOOLS: &[&str] = &["AskUserQuestion", "WebFetch", "WebSearch", "NotebookEdit"];

fn tool_list(tools: &[&str]) -> Option<Vec<String>> {
    Some(tools.iter().map(|t| t.to_string()).collect())
}

/// The standard build -> code review -> validate pipeline, used when no
/// pipeline file is given.
pub fn default_pipeline() -> PipelineConfig {
    let build = StageConfig::new(
        "build",
        PromptSource::Inline(BUILD_PROMPT.to_string()),
        Completion::Promise(PromiseCompletion::new(vec![
            "TASK_COMPLETE".to_string(),
            "BUILD_COMPLETE".to_string(),
        ])),
    )
    .with_transition("TASK_COMPLETE", "build")
    .with_transition("BUILD_COMPLETE", "code_review");
    let build = StageConfig {
        allowed_tools: tool_list(BUILD_ALLOWED_TOOLS),
        denied_tools: tool_list(BUILD_DENIED_TOOLS),
        ..build
    };

    let review = StageConfig::new(
        "code_review",
        PromptSource::Inline(REVIEW_PROMPT.to_string()),
        Completion::Promise(PromiseCompletion::new(vec!["REVIEW_COMPLETE".to_string()])),
    )
    .with_max_iterations(3)
    .with_transition("REVIEW_COMPLETE", "validate");

    let validate = StageConfig::new(
        "validate",
        PromptSource::Inline(VALIDATE_PROMPT.to_string()),
        Completion::Composite(CompositeCompletion {
            strategies: vec![
                Completion::Json(JsonCompletion::new(vec![
                    "COMPLETE".to_string(),
                    "GAPS_FOUND".to_string(),
                ])),
                Completion::Promise(PromiseCompletion::new(vec![
                    "VALIDATION:COMPLETE".to_string(),
                    "VALIDATION:GAPS_FOUND".to_string(),
                ])),
            ],
        }),
    )
    .with_max_iterations(1)
    .with_transition("GAPS_FOUND", "build");

    PipelineConfig::new("build-review-validate", "build")
        .with_stage(build)
        .with_stage(review)
        .with_stage(validate)
        .with_end_signals(&["COMPLETE"])
}
