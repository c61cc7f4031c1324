//! Single-step execution: gates, dispatch, transcripts, effects.
//!
//! Every step passes the same gauntlet: cancellation, budget, policy, then
//! the dry-run short-circuit, then its tool. Tool-level problems (a failing
//! command, an unreadable file, a rejected patch) are soft failures captured
//! in the [`StepResult`]; budget and policy refusals are hard stops returned
//! as errors the caller can downcast.

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::LazyLock;
use std::time::Instant;

use anyhow::{Error, Result};
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::core::budget::{Budget, BudgetExceededError, BudgetKind};
use crate::core::policy::Policy;
use crate::core::types::{
    Config, EffectKind, ExecResult, OutcomeKind, Step, StepEffect, StepResult, ToolKind,
};
use crate::io::clock::{CancelToken, Clock};
use crate::io::files::Files;
use crate::io::llm::Llm;
use crate::io::shell::Shell;

/// Cap on a single step's transcript.
pub const MAX_STEP_TRANSCRIPT_BYTES: usize = 64_000;

static LINE_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bline\s+(\d+)\b").expect("line number regex"));

/// Executes one step under the run's config.
pub trait Runner {
    fn run_step(&self, cancel: &CancelToken, config: &Config, step: &Step) -> Result<StepResult>;
}

/// The capability set a runner dispatches to.
pub struct Tools {
    pub shell: Rc<dyn Shell>,
    pub llm: Rc<dyn Llm>,
    pub files: Rc<dyn Files>,
}

/// Production [`Runner`].
pub struct DefaultRunner {
    tools: Tools,
    clock: Rc<dyn Clock>,
    budget: Rc<dyn Budget>,
    policy: Rc<dyn Policy>,
}

impl DefaultRunner {
    pub fn new(
        tools: Tools,
        clock: Rc<dyn Clock>,
        budget: Rc<dyn Budget>,
        policy: Rc<dyn Policy>,
    ) -> Self {
        DefaultRunner { tools, clock, budget, policy }
    }

    fn finish(
        &self,
        step: &Step,
        outcome: OutcomeKind,
        output: String,
        transcript: String,
        started: Instant,
        exec: Option<ExecResult>,
        effects: Vec<StepEffect>,
    ) -> StepResult {
        StepResult {
            step: step.clone(),
            outcome,
            output,
            transcript: limit_transcript(transcript),
            duration: self.clock.now().saturating_duration_since(started),
            exec,
            effects,
        }
    }

    fn soft_failure(
        &self,
        step: &Step,
        mut transcript: String,
        message: &str,
        started: Instant,
    ) -> StepResult {
        warn!(step = %step.kind, message, "step failed");
        transcript.push_str(&format!("[error] {message}\n"));
        self.finish(
            step,
            OutcomeKind::Error,
            message.to_string(),
            transcript,
            started,
            None,
            Vec::new(),
        )
    }

    fn run_shell(
        &self,
        cancel: &CancelToken,
        config: &Config,
        step: &Step,
        started: Instant,
    ) -> Result<StepResult> {
        self.budget
            .allow_tool(ToolKind::Shell, self.clock.now())
            .map_err(hard_stop)?;

        let mut transcript = format!(
            "[shell:start] workdir={:?} cmd={:?} args={:?}\n",
            config.work_dir, step.command, step.args
        );
        let exec = match self
            .tools
            .shell
            .run(cancel, &config.work_dir, &step.command, &step.args)
        {
            Ok(exec) => exec,
            Err(e) => return Ok(self.soft_failure(step, transcript, &format!("{e:#}"), started)),
        };

        transcript.push_str(&format!(
            "[shell] exit={}\nstdout:\n{}\nstderr:\n{}\n",
            exec.exit_code, exec.stdout, exec.stderr
        ));
        // Prefer stdout; fall back to stderr so failing commands still have
        // something to show.
        let output = if exec.stdout.trim().is_empty() {
            exec.stderr.clone()
        } else {
            exec.stdout.clone()
        };
        let outcome = if exec.exit_code == 0 { OutcomeKind::Ok } else { OutcomeKind::Error };
        let effect = StepEffect::new(EffectKind::ShellExec, &step.command, 0)
            .with_meta("exit_code", serde_json::json!(exec.exit_code))
            .with_meta("args", serde_json::json!(step.args))
            .with_meta("workdir", serde_json::json!(config.work_dir.display().to_string()));
        Ok(self.finish(step, outcome, output, transcript, started, Some(exec), vec![effect]))
    }

    fn run_llm(&self, cancel: &CancelToken, step: &Step, started: Instant) -> Result<StepResult> {
        if step.prompt.trim().is_empty() {
            return Ok(self.soft_failure(step, String::new(), "missing llm prompt", started));
        }

        // Preflight: once the token budget is spent, refuse before making
        // another call at all.
        let now = self.clock.now();
        let snap = self.budget.snapshot(now);
        if snap.limits.max_llm_tokens > 0 && snap.llm_tokens_used >= snap.limits.max_llm_tokens {
            return Err(hard_stop(BudgetExceededError::Calls {
                kind: BudgetKind::LlmTokens,
                limit: snap.limits.max_llm_tokens,
                used: snap.llm_tokens_used,
                message: "llm token budget exceeded",
            }));
        }
        self.budget.allow_tool(ToolKind::Llm, now).map_err(hard_stop)?;

        let mut transcript = format!("[llm:start] prompt:\n{}\n", step.prompt);
        let completion = match self.tools.llm.complete(cancel, &step.prompt) {
            Ok(c) => c,
            Err(e) => return Ok(self.soft_failure(step, transcript, &format!("{e:#}"), started)),
        };
        self.budget.charge_llm_tokens(completion.tokens_used, self.clock.now());

        transcript.push_str(&format!("[llm] output:\n{}\n", completion.text));
        debug!(tokens = completion.tokens_used, "llm call complete");
        Ok(self.finish(
            step,
            OutcomeKind::Ok,
            completion.text,
            transcript,
            started,
            None,
            Vec::new(),
        ))
    }

    fn run_file(&self, config: &Config, step: &Step, started: Instant) -> Result<StepResult> {
        let op = step.op.trim().to_lowercase();
        let display_path = step.path.trim().to_string();
        if op.is_empty() || display_path.is_empty() {
            return Ok(self.soft_failure(step, String::new(), "missing file op or path", started));
        }
        self.budget
            .allow_tool(ToolKind::File, self.clock.now())
            .map_err(hard_stop)?;

        let path = resolve_path(&config.work_dir, &display_path);
        let mut transcript = format!(
            "[file:start] op={op:?} path={display_path:?} data_len={}\n",
            step.data.len()
        );

        match op.as_str() {
            "read" => match self.tools.files.read(&path) {
                Ok(contents) => {
                    transcript.push_str(&format!("[file] op={op:?} path={display_path:?}\n"));
                    Ok(self.finish(
                        step,
                        OutcomeKind::Ok,
                        contents,
                        transcript,
                        started,
                        None,
                        Vec::new(),
                    ))
                }
                Err(e) => Ok(self.soft_failure(step, transcript, &format!("{e:#}"), started)),
            },
            "write" => {
                if step.data.is_empty() {
                    return Ok(self.soft_failure(step, transcript, "write requires data", started));
                }
                match self.tools.files.write(&path, &step.data) {
                    Ok(bytes) => {
                        transcript.push_str(&format!("[file] op={op:?} path={display_path:?}\n"));
                        let effect = StepEffect::new(EffectKind::FileWrite, &display_path, bytes);
                        Ok(self.finish(
                            step,
                            OutcomeKind::Ok,
                            format!("wrote {bytes} bytes to {display_path}"),
                            transcript,
                            started,
                            None,
                            vec![effect],
                        ))
                    }
                    Err(e) => Ok(self.soft_failure(step, transcript, &format!("{e:#}"), started)),
                }
            }
            "patch" => {
                if step.data.is_empty() {
                    return Ok(self.soft_failure(step, transcript, "patch requires diff data", started));
                }
                match self.tools.files.patch(&path, &step.data) {
                    Ok(summary) => {
                        transcript.push_str(&format!(
                            "[file] op={op:?} path={display_path:?} hunks={}\n",
                            summary.hunks
                        ));
                        let effect =
                            StepEffect::new(EffectKind::FilePatch, &display_path, summary.bytes)
                                .with_meta("hunks", serde_json::json!(summary.hunks))
                                .with_meta("changed", serde_json::json!(summary.changed));
                        Ok(self.finish(
                            step,
                            OutcomeKind::Ok,
                            format!("patched {display_path} (hunks={})", summary.hunks),
                            transcript,
                            started,
                            None,
                            vec![effect],
                        ))
                    }
                    Err(e) => {
                        let message = format!("{e:#}");
                        transcript.push_str(&format!("[file] op={op:?} path={display_path:?} error={message:?}"));
                        if let Some(line) = first_mismatch_line(&message) {
                            transcript.push_str(&format!(" first_mismatch_line={line}"));
                        }
                        transcript.push('\n');
                        Ok(self.soft_failure(step, transcript, &message, started))
                    }
                }
            }
            "replace" => {
                if step.old.is_empty() {
                    return Ok(self.soft_failure(step, transcript, "replace requires old text", started));
                }
                match self.tools.files.replace(&path, &step.old, &step.new, step.n) {
                    Ok(summary) => {
                        transcript.push_str(&format!(
                            "[file] op={op:?} path={display_path:?} found={} replaced={}\n",
                            summary.found, summary.replaced
                        ));
                        let effect =
                            StepEffect::new(EffectKind::FileReplace, &display_path, summary.bytes)
                                .with_meta("found", serde_json::json!(summary.found))
                                .with_meta("replaced", serde_json::json!(summary.replaced))
                                .with_meta("n", serde_json::json!(step.n));
                        Ok(self.finish(
                            step,
                            OutcomeKind::Ok,
                            format!(
                                "replaced {} occurrence(s) in {display_path} (found={})",
                                summary.replaced, summary.found
                            ),
                            transcript,
                            started,
                            None,
                            vec![effect],
                        ))
                    }
                    Err(e) => Ok(self.soft_failure(step, transcript, &format!("{e:#}"), started)),
                }
            }
            other => Ok(self.soft_failure(
                step,
                transcript,
                &format!("unsupported file op: {other}"),
                started,
            )),
        }
    }

    fn dry_run(&self, config: &Config, step: &Step, started: Instant) -> StepResult {
        let transcript = match step.kind {
            ToolKind::Shell => format!(
                "[dry-run][shell] workdir={:?} cmd={:?} args={:?}\n",
                config.work_dir, step.command, step.args
            ),
            ToolKind::Llm => format!("[dry-run][llm] prompt_len={}\n", step.prompt.len()),
            ToolKind::File => {
                let op = step.op.trim().to_lowercase();
                let path = step.path.trim();
                match op.as_str() {
                    "patch" => format!(
                        "[dry-run][file] op={op:?} path={path:?} diff_len={}\n",
                        step.data.len()
                    ),
                    "replace" => format!(
                        "[dry-run][file] op={op:?} path={path:?} old_len={} new_len={} n={}\n",
                        step.old.len(),
                        step.new.len(),
                        step.n
                    ),
                    "write" => format!(
                        "[dry-run][file] op={op:?} path={path:?} data_len={}\n",
                        step.data.len()
                    ),
                    _ => format!("[dry-run][file] op={op:?} path={path:?}\n"),
                }
            }
        };
        debug!(step = %step.kind, "dry run");
        self.finish(step, OutcomeKind::DryRun, String::new(), transcript, started, None, Vec::new())
    }
}

impl Runner for DefaultRunner {
    #[instrument(skip_all, fields(kind = %step.kind, description = %step.description))]
    fn run_step(&self, cancel: &CancelToken, config: &Config, step: &Step) -> Result<StepResult> {
        cancel.err_if_cancelled()?;
        let started = self.clock.now();

        if let Err(e) = self.budget.allow_step(started) {
            warn!(%e, "budget refused step");
            return Err(hard_stop(e));
        }
        if let Err(e) = self.policy.allow_step(config, step) {
            warn!(%e, "policy refused step");
            return Err(Error::new(e));
        }
        if config.dry_run {
            return Ok(self.dry_run(config, step, started));
        }

        match step.kind {
            ToolKind::Shell => self.run_shell(cancel, config, step, started),
            ToolKind::Llm => self.run_llm(cancel, step, started),
            ToolKind::File => self.run_file(config, step, started),
        }
    }
}

fn hard_stop(e: BudgetExceededError) -> Error {
    Error::new(e)
}

/// Relative paths are anchored at the work dir; absolute paths pass through.
pub fn resolve_path(work_dir: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() || work_dir.as_os_str().is_empty() {
        p.to_path_buf()
    } else {
        work_dir.join(p)
    }
}

/// Pulls the `line N` position out of a diff error message, if present.
fn first_mismatch_line(message: &str) -> Option<u64> {
    LINE_NUMBER_RE
        .captures(message)
        .and_then(|caps| caps[1].parse().ok())
}

/// Caps an oversized transcript, keeping the head and marking the cut.
fn limit_transcript(transcript: String) -> String {
    if transcript.len() <= MAX_STEP_TRANSCRIPT_BYTES {
        return transcript;
    }
    let mut cut = MAX_STEP_TRANSCRIPT_BYTES;
    while !transcript.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = transcript[..cut].to_string();
    out.push_str("\n…(truncated)\n");
    out
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::budget::{BudgetLimits, CallBudget};
    use crate::core::policy::{PolicyDeniedError, PolicyRules, StaticPolicy};
    use crate::test_support::{ManualClock, MemFiles, ScriptedLlm, ScriptedShell};

    struct Fixture {
        runner: DefaultRunner,
        llm: Rc<ScriptedLlm>,
        shell: Rc<ScriptedShell>,
        files: Rc<MemFiles>,
        budget: Rc<CallBudget>,
        clock: Rc<ManualClock>,
    }

    fn fixture_with(limits: BudgetLimits, policy: StaticPolicy) -> Fixture {
        let llm = Rc::new(ScriptedLlm::new());
        let shell = Rc::new(ScriptedShell::new());
        let files = Rc::new(MemFiles::new());
        let budget = Rc::new(CallBudget::new(limits));
        let clock = Rc::new(ManualClock::new());
        let runner = DefaultRunner::new(
            Tools {
                shell: Rc::clone(&shell) as Rc<dyn crate::io::shell::Shell>,
                llm: Rc::clone(&llm) as Rc<dyn crate::io::llm::Llm>,
                files: Rc::clone(&files) as Rc<dyn crate::io::files::Files>,
            },
            Rc::clone(&clock) as Rc<dyn Clock>,
            Rc::clone(&budget) as Rc<dyn Budget>,
            Rc::new(policy) as Rc<dyn Policy>,
        );
        Fixture { runner, llm, shell, files, budget, clock }
    }

    fn fixture() -> Fixture {
        fixture_with(BudgetLimits::default(), StaticPolicy::permissive())
    }

    fn run(f: &Fixture, step: &Step) -> Result<StepResult> {
        f.runner.run_step(&CancelToken::new(), &Config::default(), step)
    }

    /// Verifies a budget refusal is a hard stop carrying the typed error.
    #[test]
    fn budget_refusal_is_hard_stop() {
        let f = fixture_with(
            BudgetLimits { max_steps: 1, ..Default::default() },
            StaticPolicy::permissive(),
        );
        f.llm.push_text("fine");
        run(&f, &Step::llm("ask", "hi")).unwrap();

        let err = run(&f, &Step::llm("ask", "hi again")).unwrap_err();
        let typed = err.downcast_ref::<BudgetExceededError>().expect("typed budget error");
        assert_eq!(typed.kind(), BudgetKind::Steps);
    }

    /// Verifies a policy refusal is a hard stop carrying the typed error,
    /// and that no tool budget is consumed.
    #[test]
    fn policy_refusal_is_hard_stop() {
        let f = fixture_with(
            BudgetLimits::default(),
            StaticPolicy::new(PolicyRules {
                denied_commands: vec!["rm".to_string()],
                ..Default::default()
            }),
        );
        let err = run(&f, &Step::shell("remove", "rm", &["-rf", "/"])).unwrap_err();
        assert!(err.downcast_ref::<PolicyDeniedError>().is_some());
        assert_eq!(f.budget.snapshot(f.clock.now()).shell_calls_used, 0);
    }

    /// Verifies dry-run mode validates and transcribes without touching any
    /// tool.
    #[test]
    fn dry_run_short_circuits() {
        let f = fixture();
        let config = Config { dry_run: true, ..Default::default() };
        let step = Step::file_write("note", "out.txt", "data");
        let res = f.runner.run_step(&CancelToken::new(), &config, &step).unwrap();
        assert_eq!(res.outcome, OutcomeKind::DryRun);
        assert!(res.transcript.contains("[dry-run][file] op=\"write\" path=\"out.txt\" data_len=4"));
        assert!(f.files.contents(Path::new("./out.txt")).is_none());
        // The step gate still charges the step counter.
        assert_eq!(f.budget.snapshot(f.clock.now()).steps_used, 1);
        assert_eq!(f.budget.snapshot(f.clock.now()).file_ops_used, 0);
    }

    /// Verifies shell success: stdout becomes the output, the exec record
    /// and a shell.exec effect are attached.
    #[test]
    fn shell_success() {
        let f = fixture();
        f.shell.push_output("listing\n", "", 0);
        let res = run(&f, &Step::shell("list", "ls", &["-la"])).unwrap();
        assert_eq!(res.outcome, OutcomeKind::Ok);
        assert_eq!(res.output, "listing\n");
        assert_eq!(res.exec.as_ref().unwrap().exit_code, 0);
        assert_eq!(res.effects.len(), 1);
        assert_eq!(res.effects[0].kind, EffectKind::ShellExec);
        assert!(res.transcript.contains("[shell] exit=0"));
    }

    /// Verifies a non-zero exit is a soft failure whose output falls back to
    /// stderr when stdout is blank.
    #[test]
    fn shell_nonzero_exit_is_soft() {
        let f = fixture();
        f.shell.push_output("", "boom\n", 2);
        let res = run(&f, &Step::shell("fail", "false", &[])).unwrap();
        assert_eq!(res.outcome, OutcomeKind::Error);
        assert_eq!(res.output, "boom\n");
    }

    /// Verifies a spawn-level shell error is a soft failure with the error
    /// in the transcript.
    #[test]
    fn shell_exec_error_is_soft() {
        let f = fixture();
        f.shell.push_error("spawn command \"nope\"");
        let res = run(&f, &Step::shell("broken", "nope", &[])).unwrap();
        assert_eq!(res.outcome, OutcomeKind::Error);
        assert!(res.transcript.contains("[error] spawn command"));
    }

    /// Verifies llm success charges actual token usage after the call.
    #[test]
    fn llm_success_charges_tokens() {
        let f = fixture();
        f.llm.push_completion("answer", 37);
        let res = run(&f, &Step::llm("ask", "question")).unwrap();
        assert_eq!(res.output, "answer");
        assert_eq!(f.budget.snapshot(f.clock.now()).llm_tokens_used, 37);
        assert!(res.transcript.contains("[llm:start] prompt:\nquestion"));
    }

    /// Verifies the token preflight refuses the call once the token budget
    /// is spent, before consuming an llm call.
    #[test]
    fn llm_token_preflight_is_hard_stop() {
        let f = fixture_with(
            BudgetLimits { max_llm_tokens: 50, ..Default::default() },
            StaticPolicy::permissive(),
        );
        f.llm.push_completion("big answer", 60);
        run(&f, &Step::llm("ask", "q1")).unwrap();

        let err = run(&f, &Step::llm("ask", "q2")).unwrap_err();
        let typed = err.downcast_ref::<BudgetExceededError>().expect("typed budget error");
        assert_eq!(typed.kind(), BudgetKind::LlmTokens);
        assert_eq!(f.budget.snapshot(f.clock.now()).llm_calls_used, 1);
    }

    /// Verifies file read returns the contents as output.
    #[test]
    fn file_read() {
        let f = fixture();
        f.files.seed(Path::new("./notes.txt"), "remember\n");
        let res = run(&f, &Step::file_read("read", "notes.txt")).unwrap();
        assert_eq!(res.output, "remember\n");
        assert_eq!(res.outcome, OutcomeKind::Ok);
    }

    /// Verifies file write reports bytes and records a file.write effect.
    #[test]
    fn file_write() {
        let f = fixture();
        let res = run(&f, &Step::file_write("save", "out.txt", "hello")).unwrap();
        assert_eq!(res.output, "wrote 5 bytes to out.txt");
        assert_eq!(res.effects[0].kind, EffectKind::FileWrite);
        assert_eq!(res.effects[0].bytes, 5);
        assert_eq!(f.files.contents(Path::new("./out.txt")).unwrap(), "hello");
    }

    /// Verifies patch success output names the hunk count and the effect
    /// carries it.
    #[test]
    fn file_patch() {
        let f = fixture();
        f.files.seed(Path::new("./code.txt"), "a\nb\nc\n");
        let res = run(
            &f,
            &Step::file_patch("fix", "code.txt", "@@ -2,1 +2,1 @@\n-b\n+B\n"),
        )
        .unwrap();
        assert_eq!(res.output, "patched code.txt (hunks=1)");
        assert_eq!(res.effects[0].kind, EffectKind::FilePatch);
        assert_eq!(f.files.contents(Path::new("./code.txt")).unwrap(), "a\nB\nc\n");
    }

    /// Verifies a failed patch is a soft failure whose transcript carries the
    /// error and the extracted mismatch line.
    #[test]
    fn file_patch_failure_reports_line() {
        let f = fixture();
        f.files.seed(Path::new("./code.txt"), "a\nb\n");
        let res = run(
            &f,
            &Step::file_patch("fix", "code.txt", "@@ -1,2 +1,2 @@\n wrong\n-b\n+B\n"),
        )
        .unwrap();
        assert_eq!(res.outcome, OutcomeKind::Error);
        assert!(res.transcript.contains("context mismatch"));
        assert!(res.transcript.contains("first_mismatch_line=1"));
        // Original untouched.
        assert_eq!(f.files.contents(Path::new("./code.txt")).unwrap(), "a\nb\n");
    }

    /// Verifies replace output reports both replaced and found counts.
    #[test]
    fn file_replace() {
        let f = fixture();
        f.files.seed(Path::new("./data.txt"), "x x x x x");
        let res = run(
            &f,
            &Step::file_replace("swap", "data.txt", "x", "y", 2),
        )
        .unwrap();
        assert_eq!(res.output, "replaced 2 occurrence(s) in data.txt (found=5)");
        assert_eq!(res.effects[0].kind, EffectKind::FileReplace);
    }

    /// Verifies an unknown file op is a soft failure naming the op.
    #[test]
    fn unknown_file_op_is_soft() {
        let f = fixture();
        let mut step = Step::file_read("odd", "a.txt");
        step.op = "Chmod".to_string();
        let res = run(&f, &step).unwrap();
        assert_eq!(res.outcome, OutcomeKind::Error);
        assert!(res.output.contains("unsupported file op: chmod"));
    }

    /// Verifies a cancelled token stops the step before any gate.
    #[test]
    fn cancelled_run_is_an_error() {
        let f = fixture();
        let token = CancelToken::new();
        token.cancel();
        let err = f
            .runner
            .run_step(&token, &Config::default(), &Step::llm("ask", "hi"))
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert_eq!(f.budget.snapshot(f.clock.now()).steps_used, 0);
    }

    /// Verifies oversized transcripts are capped with a truncation marker.
    #[test]
    fn transcript_is_capped() {
        let f = fixture();
        let huge = "x".repeat(100_000);
        f.shell.push_output(&huge, "", 0);
        let res = run(&f, &Step::shell("spam", "yes", &[])).unwrap();
        assert!(res.transcript.len() <= MAX_STEP_TRANSCRIPT_BYTES + 20);
        assert!(res.transcript.ends_with("\n…(truncated)\n"));
        // Output itself is not capped here.
        assert_eq!(res.output.len(), 100_000);
    }

    /// Verifies step durations come from the injected clock.
    #[test]
    fn duration_uses_clock() {
        let f = fixture();
        f.llm.set_on_complete_advance(&f.clock, Duration::from_millis(250));
        f.llm.push_text("ok");
        let res = run(&f, &Step::llm("ask", "hi")).unwrap();
        assert_eq!(res.duration, Duration::from_millis(250));
    }
}
