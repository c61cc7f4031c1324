//! Shared data types: steps, plans, results, effects, and run configuration.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The tool a step targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Shell,
    Llm,
    File,
}

impl ToolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolKind::Shell => "shell",
            ToolKind::Llm => "llm",
            ToolKind::File => "file",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a step concluded. Hard stops (budget/policy) never produce an outcome;
/// they surface as errors from the runner instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Ok,
    #[serde(rename = "dry-run")]
    DryRun,
    Error,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeKind::Ok => "ok",
            OutcomeKind::DryRun => "dry-run",
            OutcomeKind::Error => "error",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single unit of work. Only the fields relevant to `kind` are meaningful;
/// the rest stay at their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub kind: ToolKind,
    pub description: String,

    // shell
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,

    // llm
    #[serde(default)]
    pub prompt: String,

    // file
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub old: String,
    #[serde(default)]
    pub new: String,
    /// Replacement count for `replace`; `<= 0` means all occurrences.
    #[serde(default)]
    pub n: i64,
}

impl Step {
    fn empty(kind: ToolKind, description: &str) -> Self {
        Step {
            kind,
            description: description.to_string(),
            command: String::new(),
            args: Vec::new(),
            prompt: String::new(),
            op: String::new(),
            path: String::new(),
            data: String::new(),
            old: String::new(),
            new: String::new(),
            n: 0,
        }
    }

    pub fn shell(description: &str, command: &str, args: &[&str]) -> Self {
        Step {
            command: command.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            ..Step::empty(ToolKind::Shell, description)
        }
    }

    pub fn llm(description: &str, prompt: &str) -> Self {
        Step {
            prompt: prompt.to_string(),
            ..Step::empty(ToolKind::Llm, description)
        }
    }

    pub fn file_read(description: &str, path: &str) -> Self {
        Step {
            op: "read".to_string(),
            path: path.to_string(),
            ..Step::empty(ToolKind::File, description)
        }
    }

    pub fn file_write(description: &str, path: &str, data: &str) -> Self {
        Step {
            op: "write".to_string(),
            path: path.to_string(),
            data: data.to_string(),
            ..Step::empty(ToolKind::File, description)
        }
    }

    pub fn file_patch(description: &str, path: &str, diff: &str) -> Self {
        Step {
            op: "patch".to_string(),
            path: path.to_string(),
            data: diff.to_string(),
            ..Step::empty(ToolKind::File, description)
        }
    }

    pub fn file_replace(description: &str, path: &str, old: &str, new: &str, n: i64) -> Self {
        Step {
            op: "replace".to_string(),
            path: path.to_string(),
            old: old.to_string(),
            new: new.to_string(),
            n,
            ..Step::empty(ToolKind::File, description)
        }
    }
}

/// An ordered list of steps produced by a planner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub steps: Vec<Step>,
}

/// Raw process output from a shell step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

/// Kind of externally visible mutation a step performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectKind {
    #[serde(rename = "shell.exec")]
    ShellExec,
    #[serde(rename = "file.write")]
    FileWrite,
    #[serde(rename = "file.patch")]
    FilePatch,
    #[serde(rename = "file.replace")]
    FileReplace,
}

impl EffectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EffectKind::ShellExec => "shell.exec",
            EffectKind::FileWrite => "file.write",
            EffectKind::FilePatch => "file.patch",
            EffectKind::FileReplace => "file.replace",
        }
    }
}

impl fmt::Display for EffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A side effect record attached to a [`StepResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEffect {
    pub kind: EffectKind,
    /// Primary target (file path, or the command for shell effects).
    pub path: String,
    /// Bytes written, where that is meaningful.
    pub bytes: usize,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl StepEffect {
    pub fn new(kind: EffectKind, path: &str, bytes: usize) -> Self {
        StepEffect {
            kind,
            path: path.to_string(),
            bytes,
            meta: serde_json::Map::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: serde_json::Value) -> Self {
        self.meta.insert(key.to_string(), value);
        self
    }
}

/// Renders effects as a block suitable for an agent conversation:
/// `SIDE_EFFECTS: none` or one `- kind=... path=...` line per effect.
pub fn format_effects(effects: &[StepEffect]) -> String {
    if effects.is_empty() {
        return "SIDE_EFFECTS: none".to_string();
    }
    let mut out = String::from("SIDE_EFFECTS:\n");
    for e in effects {
        out.push_str(&format!("- kind={} path={:?} bytes={}", e.kind, e.path, e.bytes));
        if !e.meta.is_empty() {
            let meta = serde_json::to_string(&e.meta).unwrap_or_default();
            out.push_str(&format!(" meta={meta}"));
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// Counts effects by kind, rendered as `kind xN` sorted by kind name.
pub fn summarize_effects(effects: &[StepEffect]) -> String {
    if effects.is_empty() {
        return "none".to_string();
    }
    let mut counts: std::collections::BTreeMap<&'static str, usize> = std::collections::BTreeMap::new();
    for e in effects {
        *counts.entry(e.kind.as_str()).or_default() += 1;
    }
    counts
        .iter()
        .map(|(k, n)| format!("{k} x{n}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// The outcome of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub step: Step,
    pub outcome: OutcomeKind,
    /// Primary textual output (LLM text, shell stdout, file contents, or a
    /// short status line for writes).
    pub output: String,
    /// Human-readable account of what happened, bounded in size.
    pub transcript: String,
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub effects: Vec<StepEffect>,
}

/// Per-run execution configuration shared by the runner and agents.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// When set, steps are validated and transcribed but never executed.
    pub dry_run: bool,
    /// Working directory for shell commands and the containment root for
    /// file-path policy checks.
    pub work_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            dry_run: false,
            work_dir: PathBuf::from("."),
        }
    }
}

/// Accumulated state visible to step templates during plan execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecContext {
    pub goal: String,
    pub plan: Plan,
    pub results: Vec<StepResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies tool and outcome kinds serialize to their lowercase wire names.
    #[test]
    fn kind_serialization_is_lowercase() {
        assert_eq!(serde_json::to_string(&ToolKind::Shell).unwrap(), "\"shell\"");
        assert_eq!(serde_json::to_string(&ToolKind::File).unwrap(), "\"file\"");
        assert_eq!(serde_json::to_string(&OutcomeKind::DryRun).unwrap(), "\"dry-run\"");
        assert_eq!(serde_json::to_string(&EffectKind::FilePatch).unwrap(), "\"file.patch\"");
    }

    /// Verifies the conversation rendering of an empty and a populated effect
    /// list.
    #[test]
    fn format_effects_renders_lines() {
        assert_eq!(format_effects(&[]), "SIDE_EFFECTS: none");

        let effects = vec![
            StepEffect::new(EffectKind::FileWrite, "notes.txt", 12),
            StepEffect::new(EffectKind::ShellExec, "git", 0)
                .with_meta("exit_code", serde_json::json!(0)),
        ];
        let rendered = format_effects(&effects);
        assert!(rendered.starts_with("SIDE_EFFECTS:\n"));
        assert!(rendered.contains("- kind=file.write path=\"notes.txt\" bytes=12"));
        assert!(rendered.contains("- kind=shell.exec path=\"git\" bytes=0 meta={\"exit_code\":0}"));
    }

    /// Verifies the effect summary groups by kind and sorts by kind name.
    #[test]
    fn summarize_effects_counts_by_kind() {
        assert_eq!(summarize_effects(&[]), "none");

        let effects = vec![
            StepEffect::new(EffectKind::FileWrite, "a", 1),
            StepEffect::new(EffectKind::FileWrite, "b", 2),
            StepEffect::new(EffectKind::ShellExec, "ls", 0),
        ];
        assert_eq!(summarize_effects(&effects), "file.write x2, shell.exec x1");
    }
}
