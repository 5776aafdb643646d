//! Git adapter for diff capture between pipeline stages.
//!
//! The diff hooks snapshot HEAD before a build stage and collect what
//! changed afterwards, so we keep a small, explicit wrapper around `git`
//! subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Changes collected between a snapshot commit and the current worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitDiff {
    pub start_commit: String,
    pub end_commit: String,
    /// Changed paths with a status label, e.g. "src/lib.rs (modified)".
    pub changed_files: Vec<String>,
    /// One-line commit subjects in `start..HEAD`.
    pub commit_messages: Vec<String>,
}

impl GitDiff {
    /// Format changed files as a markdown list for prompt injection.
    pub fn format_file_list(&self) -> String {
        if self.changed_files.is_empty() {
            return "No files changed".to_string();
        }
        self.changed_files
            .iter()
            .map(|file| format!("- `{file}`"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Format commit subjects as a markdown list for prompt injection.
    pub fn format_commits(&self) -> String {
        if self.commit_messages.is_empty() {
            return "No commits".to_string();
        }
        self.commit_messages
            .iter()
            .map(|msg| format!("- {msg}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current HEAD short SHA.
    pub fn head_short_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--short", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Collect changed files and commit subjects since `start_commit`.
    ///
    /// Captures both committed changes (`start..HEAD`) and uncommitted ones
    /// (staged + working tree), so agents that never commit still produce a
    /// meaningful diff.
    #[instrument(skip_all, fields(start_commit))]
    pub fn collect_diff(&self, start_commit: &str) -> Result<GitDiff> {
        let end_commit = self.head_short_sha()?;

        let mut changed_files = Vec::new();
        let mut commit_messages = Vec::new();

        if start_commit != end_commit {
            let range = format!("{start_commit}..HEAD");
            let diff = self.run_capture(&["diff", "--name-status", &range])?;
            changed_files.extend(parse_name_status(&diff));

            let log = self.run_capture(&["log", "--oneline", &range])?;
            commit_messages.extend(log.lines().map(str::to_string));
        }

        let mut seen: Vec<String> = changed_files
            .iter()
            .map(|entry| strip_status_label(entry))
            .collect();
        for args in [
            ["diff", "--name-status", "HEAD"],
            ["diff", "--name-status", "--cached"],
        ] {
            let out = self.run_capture(&args)?;
            for entry in parse_name_status(&out) {
                let path = strip_status_label(&entry);
                if !seen.contains(&path) {
                    seen.push(path);
                    changed_files.push(entry);
                }
            }
        }

        debug!(
            files = changed_files.len(),
            commits = commit_messages.len(),
            "collected diff"
        );
        Ok(GitDiff {
            start_commit: start_commit.to_string(),
            end_commit,
            changed_files,
            commit_messages,
        })
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Parse `git diff --name-status` output into labelled file entries.
fn parse_name_status(output: &str) -> Vec<String> {
    let mut files = Vec::new();
    for line in output.lines() {
        let Some((status, path)) = line.split_once('\t') else {
            continue;
        };
        let label = match status.trim() {
            "A" => "added",
            "M" => "modified",
            "D" => "deleted",
            other => other,
        };
        files.push(format!("{} ({label})", path.trim()));
    }
    files
}

fn strip_status_label(entry: &str) -> String {
    entry
        .rsplit_once(" (")
        .map_or_else(|| entry.to_string(), |(path, _)| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn init_repo() -> (tempfile::TempDir, Git) {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path());
        git.run_capture(&["init", "-q"]).expect("git init");
        git.run_capture(&["config", "user.email", "test@example.com"])
            .expect("config email");
        git.run_capture(&["config", "user.name", "test"])
            .expect("config name");
        fs::write(temp.path().join("a.txt"), "one\n").expect("write");
        git.run_capture(&["add", "-A"]).expect("add");
        git.run_capture(&["commit", "-q", "-m", "init"]).expect("commit");
        (temp, git)
    }

    #[test]
    fn parses_name_status_labels() {
        let parsed = parse_name_status("A\tnew.rs\nM\tsrc/lib.rs\nD\tgone.rs\n");
        assert_eq!(
            parsed,
            vec![
                "new.rs (added)",
                "src/lib.rs (modified)",
                "gone.rs (deleted)"
            ]
        );
    }

    #[test]
    fn collects_committed_and_uncommitted_changes() {
        let (temp, git) = init_repo();
        let start = git.head_short_sha().expect("head");

        fs::write(temp.path().join("a.txt"), "two\n").expect("rewrite");
        git.run_capture(&["add", "-A"]).expect("add");
        git.run_capture(&["commit", "-q", "-m", "update a"]).expect("commit");
        fs::write(temp.path().join("a.txt"), "three\n").expect("uncommitted edit");

        let diff = git.collect_diff(&start).expect("diff");
        assert_eq!(diff.start_commit, start);
        assert_ne!(diff.end_commit, start);
        // The committed and uncommitted edits to a.txt dedup to one entry.
        assert_eq!(diff.changed_files, vec!["a.txt (modified)"]);
        assert_eq!(diff.commit_messages.len(), 1);
        assert!(diff.commit_messages[0].contains("update a"));
    }

    #[test]
    fn no_changes_formats_fallback_strings() {
        let (_temp, git) = init_repo();
        let start = git.head_short_sha().expect("head");
        let diff = git.collect_diff(&start).expect("diff");
        assert_eq!(diff.format_file_list(), "No files changed");
        assert_eq!(diff.format_commits(), "No commits");
    }
}
