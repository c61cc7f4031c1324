//! Unified-diff parsing and application with fuzzy hunk relocation.
//!
//! The applier tolerates the kind of drift LLM-produced diffs exhibit: hunk
//! headers with slightly wrong line numbers, trailing-whitespace differences
//! in context lines, and a missing newline on the final line. Context and
//! deletion lines anchor each hunk; when the declared position does not
//! match, the applier searches forward from the previous hunk and picks the
//! matching position closest to the declared one. Deletions outside the
//! end-of-file newline exception must match exactly.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static HUNK_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("hunk header regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    #[error("missing hunk header before line {line}")]
    MissingHunkHeader { line: usize },
    #[error("invalid diff line {line}: {content:?}")]
    InvalidLine { line: usize, content: String },
    #[error("hunk {hunk} starts past end of file (line {line})")]
    StartsPastEof { hunk: usize, line: usize },
    #[error("hunk {hunk}: context mismatch at line {line}")]
    ContextMismatch { hunk: usize, line: usize },
    #[error("hunk {hunk}: deletion mismatch at line {line}")]
    DeletionMismatch { hunk: usize, line: usize },
    #[error("hunk {hunk} extends past end of file at line {line}")]
    PastEof { hunk: usize, line: usize },
    #[error("overlapping or out-of-order hunks (hunk {hunk})")]
    OutOfOrder { hunk: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOpKind {
    Context,
    Add,
    Del,
}

/// One line of a hunk body. `content` carries the line text without its
/// prefix character, newline-terminated unless a `\ No newline at end of
/// file` marker followed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffOp {
    pub kind: DiffOpKind,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub ops: Vec<DiffOp>,
}

impl DiffHunk {
    /// A hunk with neither context nor deletion lines has nothing to anchor
    /// a search on; it can only apply at its declared position.
    fn is_anchorless(&self) -> bool {
        self.ops.iter().all(|op| op.kind == DiffOpKind::Add)
    }
}

/// Parses unified-diff text into hunks.
///
/// `diff `/`index `/`--- `/`+++ ` header lines are ignored wherever they
/// appear, blank lines before the first hunk are tolerated, and an empty
/// input yields no hunks.
pub fn parse_unified_diff(diff: &str) -> Result<Vec<DiffHunk>, DiffError> {
    let mut lines: Vec<&str> = diff.split('\n').collect();
    // Drop the empty artifact of a trailing newline, not a real blank line.
    if lines.last() == Some(&"") {
        lines.pop();
    }

    let mut hunks: Vec<DiffHunk> = Vec::new();
    for (idx, raw) in lines.iter().enumerate() {
        let line_no = idx + 1;
        if raw.starts_with("diff ")
            || raw.starts_with("index ")
            || raw.starts_with("--- ")
            || raw.starts_with("+++ ")
        {
            continue;
        }
        if let Some(caps) = HUNK_HEADER_RE.captures(raw) {
            let field = |i: usize, default: usize| -> usize {
                caps.get(i)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(default)
            };
            hunks.push(DiffHunk {
                old_start: field(1, 0),
                old_count: field(2, 1),
                new_start: field(3, 0),
                new_count: field(4, 1),
                ops: Vec::new(),
            });
            continue;
        }
        let Some(hunk) = hunks.last_mut() else {
            if raw.trim().is_empty() {
                continue;
            }
            return Err(DiffError::MissingHunkHeader { line: line_no });
        };
        if raw.starts_with('\\') {
            // "\ No newline at end of file": the previous op line has no
            // terminating newline in its file.
            if let Some(op) = hunk.ops.last_mut() {
                if op.content.ends_with('\n') {
                    op.content.pop();
                }
            }
            continue;
        }
        if raw.is_empty() {
            // A blank context line must still carry its leading space.
            return Err(DiffError::InvalidLine { line: line_no, content: String::new() });
        }
        let (kind, rest) = match raw.as_bytes()[0] {
            b' ' => (DiffOpKind::Context, &raw[1..]),
            b'+' => (DiffOpKind::Add, &raw[1..]),
            b'-' => (DiffOpKind::Del, &raw[1..]),
            _ => {
                return Err(DiffError::InvalidLine { line: line_no, content: (*raw).to_string() });
            }
        };
        hunk.ops.push(DiffOp { kind, content: format!("{rest}\n") });
    }
    Ok(hunks)
}

/// Applies a unified diff to `original`. An empty diff is a no-op.
pub fn apply_unified_diff(original: &str, diff: &str) -> Result<String, DiffError> {
    apply_hunks(original, &parse_unified_diff(diff)?)
}

/// Applies already-parsed hunks in order. Hunks never apply before the end
/// of the previous hunk.
pub fn apply_hunks(original: &str, hunks: &[DiffHunk]) -> Result<String, DiffError> {
    if hunks.is_empty() {
        return Ok(original.to_string());
    }
    let lines: Vec<&str> = original.split_inclusive('\n').collect();
    let mut out = String::with_capacity(original.len());
    let mut cursor = 0usize;

    for (i, hunk) in hunks.iter().enumerate() {
        let hunk_no = i + 1;
        let preferred = hunk.old_start.saturating_sub(1);
        let pos = locate_hunk(&lines, hunk, hunk_no, cursor, preferred)?;
        for line in &lines[cursor..pos] {
            out.push_str(line);
        }
        cursor = pos + emit_hunk(&lines, pos, hunk, &mut out);
    }
    for line in &lines[cursor..] {
        out.push_str(line);
    }
    Ok(out)
}

/// Finds the position a hunk applies at, searching forward from `cursor`
/// when the declared position does not match.
fn locate_hunk(
    lines: &[&str],
    hunk: &DiffHunk,
    hunk_no: usize,
    cursor: usize,
    preferred: usize,
) -> Result<usize, DiffError> {
    if hunk.is_anchorless() {
        if preferred < cursor {
            return Err(DiffError::OutOfOrder { hunk: hunk_no });
        }
        if preferred > lines.len() {
            return Err(DiffError::StartsPastEof { hunk: hunk_no, line: preferred + 1 });
        }
        return Ok(preferred);
    }

    let mut best: Option<usize> = None;
    for candidate in cursor..=lines.len() {
        if anchors_match(lines, candidate, hunk).is_ok() {
            let better = match best {
                None => true,
                Some(b) => preferred.abs_diff(candidate) < preferred.abs_diff(b),
            };
            if better {
                best = Some(candidate);
            }
        }
    }
    if let Some(pos) = best {
        return Ok(pos);
    }

    if preferred < cursor {
        return Err(DiffError::OutOfOrder { hunk: hunk_no });
    }
    if preferred > lines.len() {
        return Err(DiffError::StartsPastEof { hunk: hunk_no, line: preferred + 1 });
    }
    // Report the first mismatch at the declared position.
    match anchors_match(lines, preferred, hunk) {
        Err(Mismatch::Context(idx)) => Err(DiffError::ContextMismatch { hunk: hunk_no, line: idx + 1 }),
        Err(Mismatch::Deletion(idx)) => {
            Err(DiffError::DeletionMismatch { hunk: hunk_no, line: idx + 1 })
        }
        Err(Mismatch::PastEof(idx)) => Err(DiffError::PastEof { hunk: hunk_no, line: idx + 1 }),
        Ok(()) => unreachable!("unmatched hunk matched at preferred position"),
    }
}

enum Mismatch {
    Context(usize),
    Deletion(usize),
    PastEof(usize),
}

/// Checks whether every context and deletion line of `hunk` matches the
/// original starting at `pos`.
fn anchors_match(lines: &[&str], pos: usize, hunk: &DiffHunk) -> Result<(), Mismatch> {
    let mut idx = pos;
    for op in &hunk.ops {
        match op.kind {
            DiffOpKind::Add => {}
            DiffOpKind::Context => {
                if idx >= lines.len() {
                    return Err(Mismatch::PastEof(idx));
                }
                if !context_line_matches(lines[idx], &op.content) {
                    return Err(Mismatch::Context(idx));
                }
                idx += 1;
            }
            DiffOpKind::Del => {
                if idx >= lines.len() {
                    return Err(Mismatch::PastEof(idx));
                }
                if !deletion_line_matches(lines, idx, &op.content) {
                    return Err(Mismatch::Deletion(idx));
                }
                idx += 1;
            }
        }
    }
    Ok(())
}

/// Writes the hunk body at `pos`, keeping the original text of context lines.
/// Returns how many original lines the hunk consumed.
fn emit_hunk(lines: &[&str], pos: usize, hunk: &DiffHunk, out: &mut String) -> usize {
    let mut idx = pos;
    for op in &hunk.ops {
        match op.kind {
            DiffOpKind::Add => out.push_str(&op.content),
            DiffOpKind::Context => {
                out.push_str(lines[idx]);
                idx += 1;
            }
            DiffOpKind::Del => idx += 1,
        }
    }
    idx - pos
}

/// Context lines match exactly, or after normalizing line endings and
/// trailing spaces and tabs on both sides.
fn context_line_matches(original: &str, want: &str) -> bool {
    original == want || normalize_line(original) == normalize_line(want)
}

/// Deletions match exactly. The only exception is the final original line
/// when it lacks a terminating newline the diff line carries.
fn deletion_line_matches(lines: &[&str], idx: usize, want: &str) -> bool {
    let original = lines[idx];
    if original == want {
        return true;
    }
    idx == lines.len() - 1
        && !original.ends_with('\n')
        && want.strip_suffix('\n') == Some(original)
}

fn normalize_line(line: &str) -> &str {
    line.trim_end_matches('\n')
        .trim_end_matches('\r')
        .trim_end_matches([' ', '\t'])
}
