//! Prompt template sources and placeholder substitution.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::core::types::{ContextMap, value_display};

/// Where a stage's prompt template comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptSource {
    /// Read from a file on first use.
    File(PathBuf),
    /// Use the given text as-is.
    Inline(String),
}

impl PromptSource {
    /// Load the template text.
    pub fn load(&self) -> Result<String> {
        match self {
            Self::File(path) => fs::read_to_string(path)
                .with_context(|| format!("read prompt template {}", path.display())),
            Self::Inline(text) => Ok(text.clone()),
        }
    }
}

/// Replace every `{key}` placeholder whose key exists in the context.
///
/// Placeholders without a matching context key are left untouched, so a test
/// can assert that expected wiring actually happened by checking the
/// placeholder survived.
pub fn substitute(template: &str, context: &ContextMap) -> String {
    let mut prompt = template.to_string();
    for (key, value) in context {
        let placeholder = format!("{{{key}}}");
        if prompt.contains(&placeholder) {
            prompt = prompt.replace(&placeholder, &value_display(value));
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_known_keys() {
        let mut context = ContextMap::new();
        context.insert("tasks_file".to_string(), json!("docs/tasks.md"));
        let prompt = substitute("Work through {tasks_file}.", &context);
        assert_eq!(prompt, "Work through docs/tasks.md.");
    }

    #[test]
    fn unknown_placeholders_survive() {
        let context = ContextMap::new();
        let prompt = substitute("Missing: {not_wired}", &context);
        assert_eq!(prompt, "Missing: {not_wired}");
    }

    #[test]
    fn repeated_placeholders_all_replaced() {
        let mut context = ContextMap::new();
        context.insert("n".to_string(), json!(2));
        assert_eq!(substitute("{n} and {n}", &context), "2 and 2");
    }

    #[test]
    fn inline_source_loads_verbatim() {
        let source = PromptSource::Inline("hello {name}".to_string());
        assert_eq!(source.load().expect("load"), "hello {name}");
    }

    #[test]
    fn file_source_reads_from_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("prompt.md");
        fs::write(&path, "from disk").expect("write");
        let source = PromptSource::File(path);
        assert_eq!(source.load().expect("load"), "from disk");
    }

    #[test]
    fn missing_file_errors_with_path() {
        let source = PromptSource::File(PathBuf::from("/definitely/missing/prompt.md"));
        let err = source.load().unwrap_err();
        assert!(err.to_string().contains("prompt.md"));
    }
}
