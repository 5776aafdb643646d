//! Agent backends for executing prompts.
//!
//! The [`AgentRunner`] trait decouples stage execution from the concrete
//! coding-agent CLI (Claude Code or Codex). Tests use scripted runners that
//! return canned replies without spawning processes.
//!
//! A non-zero exit code with captured output is a normal reply that flows to
//! the completion strategy. Only invocation-layer failures (binary missing,
//! timeout) become an [`AgentError`], which aborts the stage's iteration
//! loop.

use std::fmt;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_command_with_timeout;
use crate::stats::UsageStats;

/// Default wall-clock budget for one agent invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Truncate captured agent output beyond this many bytes.
const OUTPUT_LIMIT_BYTES: usize = 4_000_000;

/// One prompt execution request.
#[derive(Debug, Clone)]
pub struct AgentRequest<'a> {
    /// Full prompt text, fed to the agent on stdin.
    pub prompt: String,
    /// Tool allowlist, forwarded opaquely to the backend.
    pub allowed_tools: Option<&'a [String]>,
    /// Tool denylist, forwarded opaquely to the backend.
    pub denied_tools: Option<&'a [String]>,
}

/// Captured agent reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    pub exit_code: i32,
    /// Assistant text accumulated from the backend's event stream.
    pub output: String,
    pub stderr: String,
}

/// Invocation-layer failures that abort a stage's iteration loop.
#[derive(Debug)]
pub enum AgentError {
    /// The agent CLI binary is not installed or not on PATH.
    NotFound { binary: String },
    /// The process exceeded its wall-clock budget and was killed.
    TimedOut { binary: String, timeout: Duration },
    /// Any other spawn or pipe failure.
    Invocation { binary: String, message: String },
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { binary } => write!(f, "agent binary '{binary}' not found on PATH"),
            Self::TimedOut { binary, timeout } => {
                write!(f, "agent '{binary}' timed out after {timeout:?}")
            }
            Self::Invocation { binary, message } => {
                write!(f, "agent '{binary}' invocation failed: {message}")
            }
        }
    }
}

impl std::error::Error for AgentError {}

/// Abstraction over coding-agent CLI backends.
pub trait AgentRunner: fmt::Debug {
    /// Backend name used in logs and factory lookup.
    fn name(&self) -> &str;

    /// Execute one prompt and capture the full reply.
    fn run_prompt(
        &self,
        request: &AgentRequest<'_>,
        stats: &mut UsageStats,
    ) -> Result<AgentReply, AgentError>;
}

impl<T: AgentRunner + ?Sized> AgentRunner for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn run_prompt(
        &self,
        request: &AgentRequest<'_>,
        stats: &mut UsageStats,
    ) -> Result<AgentReply, AgentError> {
        (**self).run_prompt(request, stats)
    }
}

/// Create an agent backend by name.
pub fn agent_from_name(name: &str, timeout: Duration) -> Result<Box<dyn AgentRunner>> {
    match name {
        "claude" => Ok(Box::new(ClaudeAgent::new(timeout))),
        "codex" => Ok(Box::new(CodexAgent::new(timeout))),
        other => Err(anyhow!("unknown agent '{other}' (available: claude, codex)")),
    }
}

/// Spawn a backend process, classifying spawn/timeout failures.
fn spawn_agent(
    binary: &str,
    cmd: Command,
    prompt: &str,
    timeout: Duration,
) -> Result<crate::io::process::CommandOutput, AgentError> {
    let output = run_command_with_timeout(cmd, Some(prompt.as_bytes()), timeout, OUTPUT_LIMIT_BYTES)
        .map_err(|err| match err.downcast_ref::<std::io::Error>() {
            Some(io) if io.kind() == std::io::ErrorKind::NotFound => AgentError::NotFound {
                binary: binary.to_string(),
            },
            _ => AgentError::Invocation {
                binary: binary.to_string(),
                message: format!("{err:#}"),
            },
        })?;

    if output.timed_out {
        return Err(AgentError::TimedOut {
            binary: binary.to_string(),
            timeout,
        });
    }
    Ok(output)
}

// ---------------------------------------------------------------------------
// Claude Code
// ---------------------------------------------------------------------------

const CLAUDE_BIN: &str = "claude";

/// Claude Code backend using `claude -p` with stream-json output.
#[derive(Debug, Clone)]
pub struct ClaudeAgent {
    timeout: Duration,
}

impl ClaudeAgent {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl AgentRunner for ClaudeAgent {
    fn name(&self) -> &str {
        "claude"
    }

    #[instrument(skip_all, fields(timeout_secs = self.timeout.as_secs()))]
    fn run_prompt(
        &self,
        request: &AgentRequest<'_>,
        stats: &mut UsageStats,
    ) -> Result<AgentReply, AgentError> {
        info!("starting claude iteration");
        let mut cmd = Command::new(CLAUDE_BIN);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose");
        if let Some(allowed) = request.allowed_tools {
            cmd.arg("--allowedTools").arg(allowed.join(","));
        }
        if let Some(denied) = request.denied_tools {
            cmd.arg("--disallowedTools").arg(denied.join(","));
        }

        let output = spawn_agent(CLAUDE_BIN, cmd, &request.prompt, self.timeout)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let text = parse_claude_stream(&stdout, stats);
        let exit_code = output.status.code().unwrap_or(-1);
        debug!(exit_code, output_bytes = text.len(), "claude iteration finished");

        Ok(AgentReply {
            exit_code,
            output: text,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Accumulate assistant text from Claude's stream-json lines.
///
/// Assistant `text` blocks build the reply; `tool_use` blocks and the final
/// `result` event feed the usage counters. Lines that are not JSON are kept
/// verbatim so signal tags in plain output still reach the strategies.
fn parse_claude_stream(stdout: &str, stats: &mut UsageStats) -> String {
    let mut buffer: Vec<String> = Vec::new();

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            buffer.push(line.to_string());
            continue;
        };

        match event.get("type").and_then(Value::as_str) {
            Some("assistant") => {
                let content = event
                    .pointer("/message/content")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for item in &content {
                    match item.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(text) = item.get("text").and_then(Value::as_str)
                                && !text.trim().is_empty()
                            {
                                buffer.push(text.to_string());
                            }
                        }
                        Some("tool_use") => {
                            let name = item.get("name").and_then(Value::as_str).unwrap_or("?");
                            stats.add_tool_call(name);
                        }
                        _ => {}
                    }
                }
            }
            Some("system") => {
                // Session start carries the model id used for cost estimates.
                if stats.model.is_empty()
                    && let Some(model) = event.get("model").and_then(Value::as_str)
                {
                    stats.model = model.to_string();
                }
            }
            Some("result") => {
                // Authoritative totals for the whole session.
                if let Some(usage) = event.get("usage") {
                    stats.add_usage(usage);
                }
                if let Some(cost) = event.get("total_cost_usd").and_then(Value::as_f64) {
                    stats.reported_cost_usd += cost;
                }
                if let Some(turns) = event.get("num_turns").and_then(Value::as_u64) {
                    stats.api_turns += turns;
                }
            }
            _ => {}
        }
    }

    buffer.join("\n")
}

// ---------------------------------------------------------------------------
// Codex CLI
// ---------------------------------------------------------------------------

const CODEX_BIN: &str = "codex";

/// Codex CLI backend using `codex exec` with JSONL output.
#[derive(Debug, Clone)]
pub struct CodexAgent {
    timeout: Duration,
}

impl CodexAgent {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl AgentRunner for CodexAgent {
    fn name(&self) -> &str {
        "codex"
    }

    #[instrument(skip_all, fields(timeout_secs = self.timeout.as_secs()))]
    fn run_prompt(
        &self,
        request: &AgentRequest<'_>,
        stats: &mut UsageStats,
    ) -> Result<AgentReply, AgentError> {
        info!("starting codex iteration");
        // Codex has no per-call tool filter flags; the sandbox is the
        // boundary and the tool lists stay unused.
        if request.allowed_tools.is_some() || request.denied_tools.is_some() {
            warn!("codex backend ignores per-stage tool lists");
        }
        let mut cmd = Command::new(CODEX_BIN);
        cmd.arg("exec")
            .arg("--sandbox")
            .arg("workspace-write")
            .arg("--json");

        let output = spawn_agent(CODEX_BIN, cmd, &request.prompt, self.timeout)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let text = parse_codex_stream(&stdout, stats);
        let exit_code = output.status.code().unwrap_or(-1);
        debug!(exit_code, output_bytes = text.len(), "codex iteration finished");

        Ok(AgentReply {
            exit_code,
            output: text,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Accumulate agent messages from Codex's JSONL event stream.
fn parse_codex_stream(stdout: &str, stats: &mut UsageStats) -> String {
    let mut buffer: Vec<String> = Vec::new();

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            buffer.push(line.to_string());
            continue;
        };

        match event.get("type").and_then(Value::as_str) {
            Some("item.completed") => {
                let item = event.get("item").cloned().unwrap_or(Value::Null);
                match item.get("type").and_then(Value::as_str) {
                    Some("agent_message") => {
                        if let Some(text) = item.get("text").and_then(Value::as_str)
                            && !text.trim().is_empty()
                        {
                            buffer.push(text.to_string());
                        }
                    }
                    Some("command_execution") => stats.add_tool_call("Bash"),
                    _ => {}
                }
            }
            Some("turn.completed") => {
                if let Some(usage) = event.get("usage") {
                    // Codex reports cached reads under its own key.
                    let count =
                        |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
                    stats.input_tokens += count("input_tokens");
                    stats.output_tokens += count("output_tokens");
                    stats.cache_read_tokens += count("cached_input_tokens");
                }
            }
            _ => {}
        }
    }

    buffer.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_stream_accumulates_text_and_usage() {
        let mut stats = UsageStats::default();
        let stdout = concat!(
            r#"{"type":"system","model":"claude-sonnet-4"}"#,
            "\n",
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"working"}]}}"#,
            "\n",
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{}}]}}"#,
            "\n",
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"[[PROMISE:DONE]]"}]}}"#,
            "\n",
            r#"{"type":"result","usage":{"input_tokens":10,"output_tokens":4},"total_cost_usd":0.05,"num_turns":2}"#,
        );

        let text = parse_claude_stream(stdout, &mut stats);
        assert_eq!(text, "working\n[[PROMISE:DONE]]");
        assert_eq!(stats.model, "claude-sonnet-4");
        assert_eq!(stats.input_tokens, 10);
        assert_eq!(stats.tool_calls.get("Bash"), Some(&1));
        assert_eq!(stats.api_turns, 2);
        assert!((stats.reported_cost_usd - 0.05).abs() < 1e-9);
    }

    #[test]
    fn claude_stream_keeps_non_json_lines() {
        let mut stats = UsageStats::default();
        let text = parse_claude_stream("not json\n[[PROMISE:DONE]]", &mut stats);
        assert_eq!(text, "not json\n[[PROMISE:DONE]]");
    }

    #[test]
    fn codex_stream_accumulates_messages_and_usage() {
        let mut stats = UsageStats::default();
        let stdout = concat!(
            r#"{"type":"item.completed","item":{"type":"command_execution","command":"ls"}}"#,
            "\n",
            r#"{"type":"item.completed","item":{"type":"agent_message","text":"all set"}}"#,
            "\n",
            r#"{"type":"turn.completed","usage":{"input_tokens":7,"cached_input_tokens":3,"output_tokens":2}}"#,
        );

        let text = parse_codex_stream(stdout, &mut stats);
        assert_eq!(text, "all set");
        assert_eq!(stats.input_tokens, 7);
        assert_eq!(stats.cache_read_tokens, 3);
        assert_eq!(stats.tool_calls.get("Bash"), Some(&1));
    }

    #[test]
    fn unknown_agent_name_is_rejected() {
        let err = agent_from_name("gpt", DEFAULT_TIMEOUT).unwrap_err();
        assert!(err.to_string().contains("unknown agent"));
    }

    #[test]
    fn missing_binary_maps_to_not_found() {
        let cmd = Command::new("definitely-not-a-real-agent-xyz");
        let err = spawn_agent(
            "definitely-not-a-real-agent-xyz",
            cmd,
            "prompt",
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, AgentError::NotFound { .. }));
    }
}
