//! Stage-driven agent pipeline runner.
//!
//! Runs a coding agent (Claude Code or Codex) through a staged pipeline:
//! each stage iterates the agent until a completion signal appears in its
//! output, then transitions according to the pipeline definition.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;

use stagehand::core::events::TracingSink;
use stagehand::core::types::ContextMap;
use stagehand::exit_codes;
use stagehand::hooks::DiffHooks;
use stagehand::io::agent::agent_from_name;
use stagehand::io::config::{default_pipeline, load_pipeline};
use stagehand::io::git::Git;
use stagehand::pipeline::{PipelineExecutor, PipelineStatus};
use stagehand::stats::UsageStats;

#[derive(Parser)]
#[command(
    name = "stagehand",
    version,
    about = "Drive a coding agent through staged pipelines"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a pipeline to a terminal status.
    Run {
        /// Pipeline definition (TOML). Defaults to the built-in
        /// build -> code review -> validate pipeline.
        #[arg(long)]
        pipeline: Option<PathBuf>,
        /// Agent backend to drive ("claude" or "codex").
        #[arg(long, default_value = "claude")]
        agent: String,
        /// Wall-clock budget per agent invocation, in seconds.
        #[arg(long, default_value_t = 1800)]
        timeout_secs: u64,
        /// Initial context variables for prompt substitution.
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
        /// Capture git diffs around the "build" stage and expose
        /// changed_files / commit_messages to later prompts.
        #[arg(long)]
        diff_hooks: bool,
    },
    /// Validate a pipeline definition without running it.
    Check {
        /// Pipeline definition (TOML).
        pipeline: PathBuf,
    },
}

fn main() {
    stagehand::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            pipeline,
            agent,
            timeout_secs,
            vars,
            diff_hooks,
        } => cmd_run(pipeline, &agent, timeout_secs, &vars, diff_hooks),
        Command::Check { pipeline } => cmd_check(&pipeline),
    }
}

fn cmd_run(
    pipeline: Option<PathBuf>,
    agent: &str,
    timeout_secs: u64,
    vars: &[String],
    diff_hooks: bool,
) -> Result<i32> {
    let config = match &pipeline {
        Some(path) => load_pipeline(path)?,
        None => default_pipeline(),
    };
    let agent = agent_from_name(agent, Duration::from_secs(timeout_secs))?;
    let context = parse_vars(vars)?;

    let mut executor = PipelineExecutor::new(config, agent)?
        .with_context(context)
        .with_sink(TracingSink);
    if diff_hooks {
        let workdir = std::env::current_dir().context("resolve working directory")?;
        executor = executor.with_hooks(DiffHooks::new(Git::new(workdir), "build"));
    }

    let mut stats = UsageStats::default();
    let state = executor.run(&mut stats);

    println!("pipeline finished: {:?}", state.status);
    for (stage, signal) in &state.stage_history {
        println!("  {stage}: {}", signal.as_deref().unwrap_or("-"));
    }
    println!("{}", stats.summary());

    Ok(match state.status {
        PipelineStatus::Completed => exit_codes::OK,
        PipelineStatus::Stopped => exit_codes::STOPPED,
        _ => exit_codes::FAILED,
    })
}

fn cmd_check(path: &Path) -> Result<i32> {
    let config = load_pipeline(path)?;
    println!(
        "pipeline '{}' ok: {} stages, start '{}'",
        config.name,
        config.stages.len(),
        config.start_stage
    );
    Ok(exit_codes::OK)
}

/// Parse `key=value` pairs into an initial context.
fn parse_vars(vars: &[String]) -> Result<ContextMap> {
    let mut context = ContextMap::new();
    for var in vars {
        let Some((key, value)) = var.split_once('=') else {
            bail!("invalid --var '{var}' (expected KEY=VALUE)");
        };
        if key.trim().is_empty() {
            bail!("invalid --var '{var}' (empty key)");
        }
        context.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_defaults() {
        let cli = Cli::parse_from(["stagehand", "run"]);
        let Command::Run {
            pipeline,
            agent,
            timeout_secs,
            vars,
            diff_hooks,
        } = cli.command
        else {
            panic!("expected run command");
        };
        assert!(pipeline.is_none());
        assert_eq!(agent, "claude");
        assert_eq!(timeout_secs, 1800);
        assert!(vars.is_empty());
        assert!(!diff_hooks);
    }

    #[test]
    fn parse_run_with_vars() {
        let cli = Cli::parse_from([
            "stagehand",
            "run",
            "--var",
            "tasks_file=docs/tasks.md",
            "--var",
            "depth=standard",
        ]);
        let Command::Run { vars, .. } = cli.command else {
            panic!("expected run command");
        };
        let context = parse_vars(&vars).expect("vars");
        assert_eq!(
            context.get("tasks_file").and_then(Value::as_str),
            Some("docs/tasks.md")
        );
        assert_eq!(context.len(), 2);
    }

    #[test]
    fn rejects_malformed_var() {
        let err = parse_vars(&["no-equals".to_string()]).unwrap_err();
        assert!(err.to_string().contains("expected KEY=VALUE"));
    }
}
