//! ReAct agent: observe, decide, act, one tool call per model turn.
//!
//! The loop tolerates a misbehaving model without looping forever: malformed
//! responses get a bounded number of corrective observations, and a rolling
//! window of action signatures catches the model re-issuing the same call,
//! first steering it away and then aborting the run.

use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::LazyLock;

use anyhow::{Context, Error, Result, anyhow, bail};
use minijinja::{Environment, UndefinedBehavior, context};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::Agent;
use crate::core::budget::{Budget, BudgetExceededError, BudgetKind, BudgetSnapshot};
use crate::core::policy::PolicyDeniedError;
use crate::core::transcript::TranscriptBuffer;
use crate::core::types::{Config, OutcomeKind, Step, StepEffect, ToolKind, format_effects, summarize_effects};
use crate::io::clock::{CancelToken, Clock};
use crate::io::llm::Llm;
use crate::planexec::AGENT_TRANSCRIPT_BYTES;
use crate::planner::strip_code_fences;
use crate::runner::Runner;

/// Consecutive unparseable model responses tolerated before giving up.
pub const MAX_PARSE_RECOVERIES: u32 = 3;
/// Rolling window of action signatures the repetition guard remembers.
pub const REPEAT_WINDOW: usize = 32;
/// Occurrences within the window that trigger a steering observation.
pub const REPEAT_SOFT_LIMIT: usize = 3;
/// Occurrences within the window that abort the run.
pub const REPEAT_HARD_LIMIT: usize = 6;

static REACT_PROMPT: &str = include_str!("prompts/react.md");

static PROMPT_ENV: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template("react", REACT_PROMPT).expect("react prompt template");
    env
});

/// Iterative [`Agent`] that picks one action per LLM turn.
pub struct ReactAgent {
    llm: Rc<dyn Llm>,
    runner: Box<dyn Runner>,
    budget: Rc<dyn Budget>,
    clock: Rc<dyn Clock>,
    config: Config,
    transcript: TranscriptBuffer,
    max_parse_recoveries: u32,
    repeat_window: usize,
    repeat_soft_limit: usize,
    repeat_hard_limit: usize,
}

impl ReactAgent {
    pub fn new(
        llm: Rc<dyn Llm>,
        runner: Box<dyn Runner>,
        budget: Rc<dyn Budget>,
        clock: Rc<dyn Clock>,
        config: Config,
    ) -> Self {
        ReactAgent {
            llm,
            runner,
            budget,
            clock,
            config,
            transcript: TranscriptBuffer::new(AGENT_TRANSCRIPT_BYTES),
            max_parse_recoveries: MAX_PARSE_RECOVERIES,
            repeat_window: REPEAT_WINDOW,
            repeat_soft_limit: REPEAT_SOFT_LIMIT,
            repeat_hard_limit: REPEAT_HARD_LIMIT,
        }
    }

    /// The accumulated run transcript.
    pub fn transcript(&self) -> String {
        self.transcript.contents()
    }

    fn build_prompt(&self, conversation: &[String], snap: &BudgetSnapshot) -> Result<String> {
        let state = format!(
            "iterations_used={} llm_calls_used={} llm_tokens_used={} elapsed={:?}",
            snap.iterations_used, snap.llm_calls_used, snap.llm_tokens_used, snap.elapsed
        );
        let history = conversation.join("\n\n");
        PROMPT_ENV
            .get_template("react")
            .expect("react prompt template")
            .render(context! { state, history })
            .context("render react prompt")
    }
}

impl Agent for ReactAgent {
    #[instrument(skip_all, fields(goal_len = goal.len()))]
    fn run_goal(&mut self, cancel: &CancelToken, goal: &str) -> Result<String> {
        let goal = goal.trim();
        if goal.is_empty() {
            bail!("missing goal");
        }

        let mut conversation = vec![format!("USER: {goal}")];
        let mut effects: Vec<StepEffect> = Vec::new();
        let mut guard = RepetitionGuard::new(self.repeat_window);
        let mut parse_recoveries = 0u32;
        let mut llm_calls = 0u64;

        loop {
            cancel.err_if_cancelled()?;
            let now = self.clock.now();
            self.budget.allow_iteration(now).map_err(Error::new)?;

            let snap = self.budget.snapshot(now);
            if snap.limits.max_llm_tokens > 0 && snap.llm_tokens_used >= snap.limits.max_llm_tokens
            {
                return Err(Error::new(BudgetExceededError::Calls {
                    kind: BudgetKind::LlmTokens,
                    limit: snap.limits.max_llm_tokens,
                    used: snap.llm_tokens_used,
                    message: "llm token budget exceeded",
                }));
            }
            self.budget.allow_tool(ToolKind::Llm, now).map_err(Error::new)?;

            let prompt = self.build_prompt(&conversation, &snap)?;
            let completion = self.llm.complete(cancel, &prompt).context("react llm call")?;
            llm_calls += 1;
            self.budget
                .charge_llm_tokens(completion.tokens_used, self.clock.now());

            let action = match parse_react_response(&completion.text) {
                Ok(action) => {
                    parse_recoveries = 0;
                    action
                }
                Err(e) => {
                    parse_recoveries += 1;
                    warn!(%e, attempt = parse_recoveries, "unparseable model response");
                    if parse_recoveries > self.max_parse_recoveries {
                        bail!(
                            "agent failed to produce valid JSON after {} attempts",
                            self.max_parse_recoveries
                        );
                    }
                    conversation.push("ACTION_TAKEN: tool=LLM details=INVALID_RESPONSE".to_string());
                    conversation.push(format!(
                        "OBSERVATION: your last response was not a single valid JSON action \
                         object ({e}). Raw snippet: {:?}. Respond with exactly one JSON object.",
                        snippet(&completion.text, 200)
                    ));
                    continue;
                }
            };

            if !action.thought.trim().is_empty() {
                debug!(thought = %action.thought, "model thought");
                conversation.push(format!("THOUGHT: {}", action.thought.trim()));
            }

            if action.action_type == "answer" {
                let summary = run_summary(&effects, llm_calls);
                info!(llm_calls, effects = %summary, "goal answered");
                self.transcript.append(&format!("[done] {summary}"));
                return Ok(action.final_answer.trim_end().to_string());
            }

            let step = match action.to_step() {
                Ok(step) => step,
                Err(e) => {
                    debug!(%e, "unusable action");
                    conversation.push(format!("OBSERVATION: invalid action: {e}. Adjust and retry."));
                    continue;
                }
            };

            let signature = action_signature(&step);
            let (immediate, count) = guard.observe(&signature);
            if count >= self.repeat_hard_limit {
                warn!(signature = %signature, count, "aborting repeated tool call");
                bail!("agent appears stuck: repeated tool call too many times");
            }
            if immediate || count >= self.repeat_soft_limit {
                debug!(signature = %signature, count, "steering away from repeated call");
                conversation.push(format!("ACTION_TAKEN: tool={} details={signature}", step.kind));
                conversation.push(
                    "OBSERVATION: you already made this exact call. Stop repeating it; use the \
                     earlier OBSERVATION, or answer."
                        .to_string(),
                );
                continue;
            }

            let result = match self.runner.run_step(cancel, &self.config, &step) {
                Ok(result) => result,
                Err(e) => {
                    if e.downcast_ref::<BudgetExceededError>().is_some()
                        || e.downcast_ref::<PolicyDeniedError>().is_some()
                    {
                        info!(%e, "hard stop");
                    }
                    return Err(e);
                }
            };
            self.transcript.append(&result.transcript);
            effects.extend(result.effects.iter().cloned());
            conversation.push(format!("ACTION_TAKEN: tool={} details={signature}", step.kind));

            if result.outcome == OutcomeKind::Error {
                conversation.push(format!("OBSERVATION: ERROR {}", snippet(&result.output, 400)));
                conversation.push(format_effects(&result.effects));
                let op = step.op.trim().to_lowercase();
                if step.kind == ToolKind::File && (op == "patch" || op == "replace") {
                    conversation.push(
                        "OBSERVATION: FALLBACK REQUIRED: the edit did not apply. Read the file, \
                         then write the corrected full contents with op=write."
                            .to_string(),
                    );
                }
            } else {
                conversation.push(format!("OBSERVATION: {}", snippet(&result.output, 2000)));
                conversation.push(format_effects(&result.effects));
            }
        }
    }
}

fn run_summary(effects: &[StepEffect], llm_calls: u64) -> String {
    if effects.is_empty() {
        format!("llm.call x{llm_calls}")
    } else {
        format!("{}, llm.call x{llm_calls}", summarize_effects(effects))
    }
}

/// One decoded model turn.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReactAction {
    pub thought: String,
    pub action_type: String,
    pub tool: String,
    pub command: String,
    pub args: Vec<String>,
    pub prompt: String,
    pub op: String,
    pub path: String,
    pub data: String,
    pub old: String,
    pub new: String,
    pub n: i64,
    pub final_answer: String,
}

impl ReactAction {
    fn to_step(&self) -> Result<Step> {
        let description = if self.thought.trim().is_empty() {
            format!("{} action", self.tool)
        } else {
            self.thought.trim().to_string()
        };
        match self.tool.as_str() {
            "shell" => {
                if self.command.trim().is_empty() {
                    bail!("shell tool requires command");
                }
                let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
                Ok(Step::shell(&description, &self.command, &args))
            }
            "llm" => {
                if self.prompt.trim().is_empty() {
                    bail!("llm tool requires prompt");
                }
                Ok(Step::llm(&description, &self.prompt))
            }
            "file" => {
                if self.op.trim().is_empty() {
                    bail!("file tool requires op");
                }
                if self.path.trim().is_empty() {
                    bail!("file tool requires path");
                }
                let mut step = Step::file_read(&description, &self.path);
                step.op = self.op.clone();
                step.data = self.data.clone();
                step.old = self.old.clone();
                step.new = self.new.clone();
                step.n = self.n;
                Ok(step)
            }
            other => bail!("unknown tool {other:?}"),
        }
    }
}

/// Decodes a model turn: strips fences, extracts the first balanced JSON
/// object, normalizes the action, and validates the required fields.
pub fn parse_react_response(raw: &str) -> Result<ReactAction> {
    let cleaned = strip_code_fences(raw);
    let json = extract_first_json_object(&cleaned)
        .ok_or_else(|| anyhow!("no JSON object found"))?;
    let mut action: ReactAction = serde_json::from_str(json).context("decode action object")?;

    action.action_type = action.action_type.trim().to_lowercase();
    action.tool = action.tool.trim().to_lowercase();
    // Shorthand: naming the tool as the action type.
    if matches!(action.action_type.as_str(), "shell" | "llm" | "file") {
        if action.tool.is_empty() {
            action.tool = action.action_type.clone();
        }
        action.action_type = "tool".to_string();
    }

    match action.action_type.as_str() {
        "answer" => {
            if action.final_answer.trim().is_empty() {
                bail!("answer action requires final_answer");
            }
        }
        "tool" => {
            if action.tool.is_empty() {
                bail!("tool action requires tool");
            }
        }
        other => bail!("unknown action_type {other:?}"),
    }
    Ok(action)
}

/// Finds the first balanced `{...}` in `text`, honoring JSON strings and
/// escapes. JSON structure is ASCII, so a byte scan is UTF-8 safe.
fn extract_first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in text.as_bytes().iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Normalized identity of a tool call, used for repetition detection.
fn action_signature(step: &Step) -> String {
    match step.kind {
        ToolKind::Shell => {
            let mut parts = vec![step.command.trim()];
            parts.extend(step.args.iter().map(|a| a.trim()).filter(|a| !a.is_empty()));
            format!("shell {}", parts.join(" "))
        }
        ToolKind::Llm => {
            format!("llm len={}:{}", step.prompt.len(), snippet(&step.prompt, 80))
        }
        ToolKind::File => {
            let op = step.op.trim().to_lowercase();
            let path = step.path.trim().trim_start_matches("./");
            match op.as_str() {
                "replace" => format!(
                    "file {op}:{path} old={:?} new={:?} n={}",
                    snippet(&step.old, 40),
                    snippet(&step.new, 40),
                    step.n
                ),
                "patch" => {
                    format!("file {op}:{path} len={}:{:?}", step.data.len(), snippet(&step.data, 80))
                }
                _ => format!("file {op}:{path}"),
            }
        }
    }
}

/// Rolling window of recent action signatures.
struct RepetitionGuard {
    window: usize,
    history: VecDeque<String>,
}

impl RepetitionGuard {
    fn new(window: usize) -> Self {
        RepetitionGuard { window, history: VecDeque::new() }
    }

    /// Records a signature and reports whether it repeats the immediately
    /// preceding one, plus its occurrence count within the window.
    fn observe(&mut self, signature: &str) -> (bool, usize) {
        let immediate = self.history.back().is_some_and(|last| last == signature);
        self.history.push_back(signature.to_string());
        if self.history.len() > self.window {
            self.history.pop_front();
        }
        let count = self.history.iter().filter(|s| s.as_str() == signature).count();
        (immediate, count)
    }
}

/// Bounded prefix of `s`, cut on a char boundary, with an ellipsis when
/// anything was dropped.
fn snippet(s: &str, max_bytes: usize) -> String {
    let s = s.trim();
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut cut = max_bytes;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &s[..cut])
}
