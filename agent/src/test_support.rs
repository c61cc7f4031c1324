//! Scripted doubles for tests: deterministic LLM, shell, filesystem, and
//! clock implementations.
//!
//! Everything here records its calls so tests can assert on prompts and
//! commands, and pops pre-loaded responses in order.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};

use crate::core::types::ExecResult;
use crate::io::clock::{CancelToken, Clock};
use crate::io::files::{Files, PatchSummary, ReplaceSummary, patch_content, replace_content};
use crate::io::llm::{Completion, Llm};
use crate::io::shell::Shell;

/// LLM double that replays queued completions and records every prompt.
#[derive(Default)]
pub struct ScriptedLlm {
    responses: RefCell<VecDeque<Result<Completion, String>>>,
    prompts: RefCell<Vec<String>>,
    on_complete: RefCell<Option<Box<dyn Fn()>>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        ScriptedLlm::default()
    }

    pub fn push_text(&self, text: &str) {
        self.push_completion(text, 0);
    }

    pub fn push_completion(&self, text: &str, tokens_used: u64) {
        self.responses
            .borrow_mut()
            .push_back(Ok(Completion { text: text.to_string(), tokens_used }));
    }

    pub fn push_error(&self, message: &str) {
        self.responses.borrow_mut().push_back(Err(message.to_string()));
    }

    /// Prompts seen so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.borrow().len()
    }

    /// Advances `clock` by `step` on every completion, so step durations are
    /// deterministic in tests.
    pub fn set_on_complete_advance(&self, clock: &Rc<ManualClock>, step: Duration) {
        let clock = Rc::clone(clock);
        *self.on_complete.borrow_mut() = Some(Box::new(move || clock.advance(step)));
    }
}

impl Llm for ScriptedLlm {
    fn complete(&self, cancel: &CancelToken, prompt: &str) -> Result<Completion> {
        cancel.err_if_cancelled()?;
        self.prompts.borrow_mut().push(prompt.to_string());
        if let Some(hook) = self.on_complete.borrow().as_ref() {
            hook();
        }
        match self.responses.borrow_mut().pop_front() {
            Some(Ok(completion)) => Ok(completion),
            Some(Err(message)) => Err(anyhow!("{message}")),
            None => bail!("no scripted llm response left"),
        }
    }
}

/// Shell double that replays queued results and records every invocation.
#[derive(Default)]
pub struct ScriptedShell {
    responses: RefCell<VecDeque<Result<ExecResult, String>>>,
    calls: RefCell<Vec<(String, Vec<String>)>>,
}

impl ScriptedShell {
    pub fn new() -> Self {
        ScriptedShell::default()
    }

    pub fn push_output(&self, stdout: &str, stderr: &str, exit_code: i32) {
        self.responses.borrow_mut().push_back(Ok(ExecResult {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
            duration: Duration::ZERO,
        }));
    }

    pub fn push_error(&self, message: &str) {
        self.responses.borrow_mut().push_back(Err(message.to_string()));
    }

    /// Invocations seen so far as `(command, args)` pairs.
    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.borrow().clone()
    }
}

impl Shell for ScriptedShell {
    fn run(
        &self,
        cancel: &CancelToken,
        _work_dir: &Path,
        command: &str,
        args: &[String],
    ) -> Result<ExecResult> {
        cancel.err_if_cancelled()?;
        self.calls
            .borrow_mut()
            .push((command.to_string(), args.to_vec()));
        match self.responses.borrow_mut().pop_front() {
            Some(Ok(exec)) => Ok(exec),
            Some(Err(message)) => Err(anyhow!("{message}")),
            None => bail!("no scripted shell response left"),
        }
    }
}

/// In-memory [`Files`] with the same patch/replace semantics as the real
/// filesystem implementation.
#[derive(Default)]
pub struct MemFiles {
    files: RefCell<HashMap<PathBuf, String>>,
}

impl MemFiles {
    pub fn new() -> Self {
        MemFiles::default()
    }

    pub fn seed(&self, path: &Path, contents: &str) {
        self.files
            .borrow_mut()
            .insert(path.to_path_buf(), contents.to_string());
    }

    pub fn contents(&self, path: &Path) -> Option<String> {
        self.files.borrow().get(path).cloned()
    }
}

impl Files for MemFiles {
    fn read(&self, path: &Path) -> Result<String> {
        self.contents(path)
            .ok_or_else(|| anyhow!("read {}: no such file", path.display()))
    }

    fn write(&self, path: &Path, data: &str) -> Result<usize> {
        self.seed(path, data);
        Ok(data.len())
    }

    fn patch(&self, path: &Path, diff: &str) -> Result<PatchSummary> {
        let original = self.read(path)?;
        let (patched, hunks) = patch_content(&original, diff)?;
        let changed = patched != original;
        if changed {
            self.seed(path, &patched);
        }
        Ok(PatchSummary { hunks, changed, bytes: patched.len() })
    }

    fn replace(&self, path: &Path, old: &str, new: &str, n: i64) -> Result<ReplaceSummary> {
        let original = self.read(path)?;
        let (updated, found, replaced) = replace_content(&original, old, new, n)?;
        self.seed(path, &updated);
        Ok(ReplaceSummary { found, replaced, bytes: updated.len() })
    }
}

/// Deterministic [`Clock`] advanced explicitly by tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Cell<Instant>,
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock { now: Cell::new(Instant::now()) }
    }
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock::default()
    }

    pub fn advance(&self, step: Duration) {
        self.now.set(self.now.get() + step);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<()> {
        cancel.err_if_cancelled()?;
        self.advance(duration);
        Ok(())
    }
}
