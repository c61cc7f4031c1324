//! Static safety rules applied to every step before execution.
//!
//! Policy checks are pure and deterministic: allow-lists for tools and file
//! ops, a shell command deny-list, and lexical work-dir containment for file
//! paths and path-like shell arguments. A denial is a hard stop for the run.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::core::types::{Config, Step, ToolKind};

/// Which rule family denied the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Tool,
    ShellCommand,
    LlmPrompt,
    FileOp,
    Path,
}

impl PolicyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyKind::Tool => "tool",
            PolicyKind::ShellCommand => "shell_command",
            PolicyKind::LlmPrompt => "llm_prompt",
            PolicyKind::FileOp => "file_op",
            PolicyKind::Path => "path",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("policy denied: kind={kind} reason={reason}")]
pub struct PolicyDeniedError {
    pub kind: PolicyKind,
    pub reason: String,
}

impl PolicyDeniedError {
    fn new(kind: PolicyKind, reason: impl Into<String>) -> Self {
        PolicyDeniedError { kind, reason: reason.into() }
    }
}

/// Decides whether a step may run at all.
pub trait Policy {
    fn allow_step(&self, config: &Config, step: &Step) -> Result<(), PolicyDeniedError>;
}

/// Rule set for [`StaticPolicy`]. Empty lists mean unrestricted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyRules {
    /// Tools the run may use; empty allows all three.
    pub allowed_tools: Vec<ToolKind>,
    /// Shell commands refused by exact (trimmed) match.
    pub denied_commands: Vec<String>,
    /// File ops the run may use; `write` implies `patch` and `replace`.
    pub allowed_file_ops: Vec<String>,
    /// When set, file paths and path-like shell args must stay inside
    /// `Config::work_dir`.
    pub restrict_files_to_work_dir: bool,
}

/// Production [`Policy`]: a fixed rule set evaluated per step.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    rules: PolicyRules,
}

impl StaticPolicy {
    pub fn new(rules: PolicyRules) -> Self {
        StaticPolicy { rules }
    }

    /// Permits everything.
    pub fn permissive() -> Self {
        StaticPolicy::default()
    }

    fn check_shell(&self, config: &Config, step: &Step) -> Result<(), PolicyDeniedError> {
        let command = step.command.trim();
        if command.is_empty() {
            return Err(PolicyDeniedError::new(
                PolicyKind::ShellCommand,
                "missing shell command",
            ));
        }
        if self.rules.denied_commands.iter().any(|d| d.trim() == command) {
            return Err(PolicyDeniedError::new(
                PolicyKind::ShellCommand,
                format!("command is denied: {command}"),
            ));
        }
        if self.rules.restrict_files_to_work_dir && !config.work_dir.as_os_str().is_empty() {
            for arg in &step.args {
                let arg = arg.trim();
                if !is_path_like(arg) {
                    continue;
                }
                // Home expansion happens in the shell, not here; there is no
                // way to bound it lexically, so refuse it.
                if arg.starts_with('~') {
                    return Err(PolicyDeniedError::new(
                        PolicyKind::Path,
                        format!("path uses home expansion: {arg}"),
                    ));
                }
                if escapes_work_dir(&config.work_dir, Path::new(arg)) {
                    return Err(PolicyDeniedError::new(
                        PolicyKind::Path,
                        format!("shell arg escapes work dir: {arg}"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_llm(&self, step: &Step) -> Result<(), PolicyDeniedError> {
        if step.prompt.trim().is_empty() {
            return Err(PolicyDeniedError::new(PolicyKind::LlmPrompt, "missing llm prompt"));
        }
        Ok(())
    }

    fn check_file(&self, config: &Config, step: &Step) -> Result<(), PolicyDeniedError> {
        let op = step.op.trim().to_lowercase();
        if op.is_empty() {
            return Err(PolicyDeniedError::new(PolicyKind::FileOp, "missing file op"));
        }
        if step.path.trim().is_empty() {
            return Err(PolicyDeniedError::new(PolicyKind::Path, "missing file path"));
        }
        if op == "patch" && step.data.is_empty() {
            return Err(PolicyDeniedError::new(PolicyKind::FileOp, "patch requires diff data"));
        }
        if op == "replace" && step.old.is_empty() {
            return Err(PolicyDeniedError::new(PolicyKind::FileOp, "replace requires old text"));
        }
        if !self.rules.allowed_file_ops.is_empty() {
            let allowed = |candidate: &str| {
                self.rules
                    .allowed_file_ops
                    .iter()
                    .any(|a| a.trim().eq_ignore_ascii_case(candidate))
            };
            // Patch and replace are alternate spellings of a write.
            let permitted = allowed(&op)
                || ((op == "patch" || op == "replace") && allowed("write"));
            if !permitted {
                return Err(PolicyDeniedError::new(
                    PolicyKind::FileOp,
                    format!("file op not allowed: {op}"),
                ));
            }
        }
        if self.rules.restrict_files_to_work_dir
            && !config.work_dir.as_os_str().is_empty()
            && escapes_work_dir(&config.work_dir, Path::new(step.path.trim()))
        {
            return Err(PolicyDeniedError::new(
                PolicyKind::Path,
                format!("path escapes work dir: {}", step.path.trim()),
            ));
        }
        Ok(())
    }
}

impl Policy for StaticPolicy {
    fn allow_step(&self, config: &Config, step: &Step) -> Result<(), PolicyDeniedError> {
        if !self.rules.allowed_tools.is_empty() && !self.rules.allowed_tools.contains(&step.kind) {
            return Err(PolicyDeniedError::new(
                PolicyKind::Tool,
                format!("tool not allowed: {}", step.kind),
            ));
        }
        match step.kind {
            ToolKind::Shell => self.check_shell(config, step),
            ToolKind::Llm => self.check_llm(step),
            ToolKind::File => self.check_file(config, step),
        }
    }
}

/// Recognizes a shell argument as a filesystem path.
///
/// Only arguments that start with `/`, `~`, `./` or `../`, or contain a `..`
/// path segment, are path-like. Flag values such as `--pattern=..` are plain
/// strings and must never trip the containment check.
fn is_path_like(arg: &str) -> bool {
    if arg.starts_with('/') || arg.starts_with('~') || arg.starts_with("./") || arg.starts_with("../")
    {
        return true;
    }
    arg.split('/').any(|segment| segment == "..")
}

/// Lexical containment: true when `candidate` resolves outside `work_dir`.
///
/// Both paths are normalized without touching the filesystem (the target may
/// not exist yet). Relative candidates are anchored at the work dir.
pub fn escapes_work_dir(work_dir: &Path, candidate: &Path) -> bool {
    if work_dir.as_os_str().is_empty() {
        return false;
    }
    let wd = lexical_clean(work_dir);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        wd.join(candidate)
    };
    let resolved = lexical_clean(&joined);
    if wd == Path::new(".") {
        // "." has no prefix for starts_with to see; any relative path that
        // does not climb out is contained.
        return resolved.is_absolute()
            || resolved.components().next() == Some(Component::ParentDir);
    }
    !resolved.starts_with(&wd)
}

/// Removes `.` segments and resolves `..` against preceding components
/// without consulting the filesystem. The parent of the root is the root.
fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}
