//! File operations backing file steps: read, write, patch, replace.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{debug, instrument};

use crate::core::diff::{apply_hunks, parse_unified_diff};

/// Outcome of a patch op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSummary {
    pub hunks: usize,
    /// False when the patch was a byte-identical no-op and nothing was
    /// written.
    pub changed: bool,
    pub bytes: usize,
}

/// Outcome of a replace op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaceSummary {
    pub found: usize,
    pub replaced: usize,
    pub bytes: usize,
}

/// Filesystem access for file steps. Paths arrive already resolved against
/// the work dir.
pub trait Files {
    fn read(&self, path: &Path) -> Result<String>;
    /// Writes `data`, returning the byte count.
    fn write(&self, path: &Path, data: &str) -> Result<usize>;
    fn patch(&self, path: &Path, diff: &str) -> Result<PatchSummary>;
    fn replace(&self, path: &Path, old: &str, new: &str, n: i64) -> Result<ReplaceSummary>;
}

/// Applies a unified diff to `original`, returning the patched text and the
/// hunk count.
pub fn patch_content(original: &str, diff: &str) -> Result<(String, usize)> {
    let hunks = parse_unified_diff(diff)?;
    let patched = apply_hunks(original, &hunks)?;
    Ok((patched, hunks.len()))
}

/// Replaces occurrences of `old` with `new`. `n <= 0` replaces all. Errors
/// when the pattern is absent or the result is byte-identical.
pub fn replace_content(original: &str, old: &str, new: &str, n: i64) -> Result<(String, usize, usize)> {
    if old.is_empty() {
        bail!("replace requires non-empty old text");
    }
    let found = original.matches(old).count();
    if found == 0 {
        bail!("pattern not found: {old:?}");
    }
    let updated = if n <= 0 {
        original.replace(old, new)
    } else {
        original.replacen(old, new, n as usize)
    };
    if updated == original {
        bail!("no changes applied");
    }
    let replaced = if n <= 0 { found } else { found.min(n as usize) };
    Ok((updated, found, replaced))
}

/// Production [`Files`] backed by the real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsFiles;

impl Files for FsFiles {
    fn read(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
    }

    fn write(&self, path: &Path, data: &str) -> Result<usize> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create parent dir {}", parent.display()))?;
        }
        fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
        Ok(data.len())
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    fn patch(&self, path: &Path, diff: &str) -> Result<PatchSummary> {
        let original = self.read(path)?;
        let (patched, hunks) = patch_content(&original, diff)?;
        let changed = patched != original;
        if changed {
            fs::write(path, &patched).with_context(|| format!("write {}", path.display()))?;
        } else {
            debug!("patch produced identical content, skipping write");
        }
        Ok(PatchSummary { hunks, changed, bytes: patched.len() })
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    fn replace(&self, path: &Path, old: &str, new: &str, n: i64) -> Result<ReplaceSummary> {
        let original = self.read(path)?;
        let (updated, found, replaced) = replace_content(&original, old, new, n)?;
        fs::write(path, &updated).with_context(|| format!("write {}", path.display()))?;
        debug!(found, replaced, "replace applied");
        Ok(ReplaceSummary { found, replaced, bytes: updated.len() })
    }
}
