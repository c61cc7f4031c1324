//! Goal-to-plan translation through the LLM.
//!
//! The planner prompts for a JSON plan, strips any code fences the model
//! wrapped it in, parses it into typed steps, and statically validates both
//! the plan structure and every step template before anything executes.

use std::rc::Rc;
use std::sync::LazyLock;

use anyhow::{Context, Error, Result, bail};
use minijinja::{Environment, UndefinedBehavior, context};
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::core::budget::Budget;
use crate::core::template::validate_step_templates;
use crate::core::types::{Plan, Step, ToolKind};
use crate::io::clock::{CancelToken, Clock};
use crate::io::llm::Llm;

static PLANNER_PROMPT: &str = include_str!("prompts/planner.md");

static PROMPT_ENV: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template("planner", PLANNER_PROMPT)
        .expect("planner prompt template");
    env
});

/// Produces a validated plan for a goal.
pub trait Planner {
    fn plan(&self, cancel: &CancelToken, goal: &str) -> Result<Plan>;
}

/// Production [`Planner`] backed by an LLM.
pub struct LlmPlanner {
    llm: Rc<dyn Llm>,
    budget: Rc<dyn Budget>,
    clock: Rc<dyn Clock>,
    on_raw: Option<Box<dyn Fn(&str)>>,
}

impl LlmPlanner {
    pub fn new(llm: Rc<dyn Llm>, budget: Rc<dyn Budget>, clock: Rc<dyn Clock>) -> Self {
        LlmPlanner { llm, budget, clock, on_raw: None }
    }

    /// Installs a sink that receives the raw model output before parsing,
    /// for debugging and capture.
    pub fn with_raw_sink(mut self, sink: impl Fn(&str) + 'static) -> Self {
        self.on_raw = Some(Box::new(sink));
        self
    }
}

impl Planner for LlmPlanner {
    #[instrument(skip_all, fields(goal_len = goal.len()))]
    fn plan(&self, cancel: &CancelToken, goal: &str) -> Result<Plan> {
        let goal = goal.trim();
        if goal.is_empty() {
            bail!("missing goal");
        }
        self.budget
            .allow_tool(ToolKind::Llm, self.clock.now())
            .map_err(Error::new)?;

        let prompt = PROMPT_ENV
            .get_template("planner")
            .expect("planner prompt template")
            .render(context! { goal })
            .context("render planner prompt")?;

        let completion = self.llm.complete(cancel, &prompt).context("planner llm call")?;
        if let Some(sink) = &self.on_raw {
            sink(&completion.text);
        }
        self.budget
            .charge_llm_tokens(completion.tokens_used, self.clock.now());

        let plan = parse_plan(&completion.text, goal)?;
        validate_plan(&plan)?;
        info!(steps = plan.steps.len(), "plan ready");
        for (i, step) in plan.steps.iter().enumerate() {
            debug!(i, kind = %step.kind, description = %step.description, "planned step");
        }
        Ok(plan)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PlanDoc {
    goal: String,
    steps: Vec<StepDoc>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StepDoc {
    #[serde(rename = "type")]
    kind: String,
    description: String,
    command: String,
    args: Vec<String>,
    prompt: String,
    op: String,
    path: String,
    data: String,
    old: String,
    new: String,
    n: i64,
}

/// Parses the raw model output into a [`Plan`], falling back to
/// `fallback_goal` when the model omitted the goal.
fn parse_plan(raw: &str, fallback_goal: &str) -> Result<Plan> {
    let cleaned = strip_code_fences(raw);
    let doc: PlanDoc = serde_json::from_str(&cleaned).context("parse plan JSON")?;

    let mut steps = Vec::with_capacity(doc.steps.len());
    for (i, step) in doc.steps.into_iter().enumerate() {
        steps.push(convert_step(i, step)?);
    }
    let goal = if doc.goal.trim().is_empty() {
        fallback_goal.to_string()
    } else {
        doc.goal.trim().to_string()
    };
    Ok(Plan { goal, steps })
}

fn convert_step(index: usize, doc: StepDoc) -> Result<Step> {
    let kind = match doc.kind.trim().to_lowercase().as_str() {
        "shell" => ToolKind::Shell,
        "llm" => ToolKind::Llm,
        "file" => ToolKind::File,
        other => bail!("step {index}: unknown step type {other:?}"),
    };
    if doc.description.trim().is_empty() {
        bail!("step {index}: missing description");
    }
    match kind {
        ToolKind::Shell if doc.command.trim().is_empty() => {
            bail!("step {index}: shell step requires command");
        }
        ToolKind::Llm if doc.prompt.trim().is_empty() => {
            bail!("step {index}: llm step requires prompt");
        }
        ToolKind::File if doc.op.trim().is_empty() || doc.path.trim().is_empty() => {
            bail!("step {index}: file step requires op and path");
        }
        _ => {}
    }
    Ok(Step {
        kind,
        description: doc.description.trim().to_string(),
        command: doc.command,
        args: doc.args,
        prompt: doc.prompt,
        op: doc.op,
        path: doc.path,
        data: doc.data,
        old: doc.old,
        new: doc.new,
        n: doc.n,
    })
}

/// Structural and template validation of a parsed plan.
fn validate_plan(plan: &Plan) -> Result<()> {
    if plan.steps.is_empty() {
        bail!("plan has no steps");
    }
    for (i, step) in plan.steps.iter().enumerate() {
        validate_step_templates(i, step).context("invalid plan")?;
    }
    Ok(())
}

/// Removes a surrounding Markdown code fence, with or without a language
/// tag, leaving other text untouched.
pub(crate) fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut lines: Vec<&str> = trimmed.lines().collect();
    lines.remove(0);
    if lines.last().is_some_and(|l| l.trim() == "```") {
        lines.pop();
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::budget::{BudgetExceededError, BudgetKind, BudgetLimits, CallBudget};
    use crate::test_support::{ManualClock, ScriptedLlm};
    use std::cell::RefCell;

    struct Fixture {
        planner: LlmPlanner,
        llm: Rc<ScriptedLlm>,
        budget: Rc<CallBudget>,
    }

    fn fixture_with(limits: BudgetLimits) -> Fixture {
        let llm = Rc::new(ScriptedLlm::new());
        let budget = Rc::new(CallBudget::new(limits));
        let clock = Rc::new(ManualClock::new());
        let planner = LlmPlanner::new(
            Rc::clone(&llm) as Rc<dyn Llm>,
            Rc::clone(&budget) as Rc<dyn Budget>,
            clock as Rc<dyn Clock>,
        );
        Fixture { planner, llm, budget }
    }

    fn fixture() -> Fixture {
        fixture_with(BudgetLimits::default())
    }

    const SIMPLE_PLAN: &str = r#"{
        "goal": "list and summarize",
        "steps": [
            {"type": "shell", "description": "list files", "command": "ls", "args": ["-la"]},
            {"type": "llm", "description": "summarize", "prompt": "Summarize:\n{{ results[0].output }}"}
        ]
    }"#;

    /// Verifies a well-formed plan parses into typed steps.
    #[test]
    fn parses_valid_plan() {
        let f = fixture();
        f.llm.push_completion(SIMPLE_PLAN, 42);
        let plan = f.planner.plan(&CancelToken::new(), "list and summarize").unwrap();
        assert_eq!(plan.goal, "list and summarize");
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].kind, ToolKind::Shell);
        assert_eq!(plan.steps[1].kind, ToolKind::Llm);
    }

    /// Verifies code fences around the JSON are stripped, with and without a
    /// language tag.
    #[test]
    fn strips_code_fences_from_output() {
        let f = fixture();
        f.llm.push_text(&format!("```json\n{SIMPLE_PLAN}\n```"));
        f.planner.plan(&CancelToken::new(), "goal").unwrap();

        f.llm.push_text(&format!("```\n{SIMPLE_PLAN}\n```"));
        f.planner.plan(&CancelToken::new(), "goal").unwrap();
    }

    /// Verifies the goal falls back to the requested goal when the plan
    /// omits it.
    #[test]
    fn missing_goal_falls_back() {
        let f = fixture();
        f.llm.push_text(
            r#"{"steps": [{"type": "shell", "description": "list", "command": "ls"}]}"#,
        );
        let plan = f.planner.plan(&CancelToken::new(), "the real goal").unwrap();
        assert_eq!(plan.goal, "the real goal");
    }

    /// Verifies a blank goal is refused before any LLM call.
    #[test]
    fn blank_goal_is_refused() {
        let f = fixture();
        let err = f.planner.plan(&CancelToken::new(), "   ").unwrap_err();
        assert!(err.to_string().contains("missing goal"));
        assert_eq!(f.llm.calls(), 0);
    }

    /// Verifies planner LLM calls are charged against the budget, and a
    /// spent call budget is a typed hard stop.
    #[test]
    fn planning_consumes_llm_budget() {
        let f = fixture_with(BudgetLimits { max_llm_calls: 1, ..Default::default() });
        f.llm.push_completion(SIMPLE_PLAN, 17);
        f.planner.plan(&CancelToken::new(), "goal").unwrap();
        assert_eq!(f.budget.snapshot(std::time::Instant::now()).llm_tokens_used, 17);

        let err = f.planner.plan(&CancelToken::new(), "goal").unwrap_err();
        let typed = err.downcast_ref::<BudgetExceededError>().expect("typed budget error");
        assert_eq!(typed.kind(), BudgetKind::LlmCalls);
    }

    /// Verifies structural rejections: empty steps, unknown type, missing
    /// per-type fields.
    #[test]
    fn structural_validation() {
        let f = fixture();

        f.llm.push_text(r#"{"goal": "g", "steps": []}"#);
        let err = f.planner.plan(&CancelToken::new(), "goal").unwrap_err();
        assert!(err.to_string().contains("plan has no steps"));

        f.llm.push_text(r#"{"steps": [{"type": "network", "description": "d"}]}"#);
        let err = f.planner.plan(&CancelToken::new(), "goal").unwrap_err();
        assert!(err.to_string().contains("unknown step type \"network\""));

        f.llm.push_text(r#"{"steps": [{"type": "shell", "description": "d"}]}"#);
        let err = f.planner.plan(&CancelToken::new(), "goal").unwrap_err();
        assert!(err.to_string().contains("shell step requires command"));
    }

    /// Verifies template validation runs at plan time: a step referencing
    /// its own result never reaches execution.
    #[test]
    fn rejects_forward_template_reference() {
        let f = fixture();
        f.llm.push_text(
            r#"{"steps": [{"type": "llm", "description": "d", "prompt": "{{ results[0].output }}"}]}"#,
        );
        let err = f.planner.plan(&CancelToken::new(), "goal").unwrap_err();
        assert!(format!("{err:#}").contains("only prior results are available"));
    }

    /// Verifies the rendered prompt carries the goal and keeps the literal
    /// template examples intact.
    #[test]
    fn prompt_includes_goal_and_examples() {
        let f = fixture();
        f.llm.push_text(SIMPLE_PLAN);
        f.planner.plan(&CancelToken::new(), "organize the notes").unwrap();
        let prompts = f.llm.prompts();
        assert!(prompts[0].contains("organize the notes"));
        assert!(prompts[0].contains("{{ results[0].output }}"));
    }

    /// Verifies the raw sink observes the unparsed model output.
    #[test]
    fn raw_sink_sees_model_output() {
        let llm = Rc::new(ScriptedLlm::new());
        let seen = Rc::new(RefCell::new(Vec::<String>::new()));
        let sink_seen = Rc::clone(&seen);
        let planner = LlmPlanner::new(
            Rc::clone(&llm) as Rc<dyn Llm>,
            Rc::new(CallBudget::unlimited()) as Rc<dyn Budget>,
            Rc::new(ManualClock::new()) as Rc<dyn Clock>,
        )
        .with_raw_sink(move |raw| sink_seen.borrow_mut().push(raw.to_string()));

        llm.push_text(SIMPLE_PLAN);
        planner.plan(&CancelToken::new(), "goal").unwrap();
        assert_eq!(seen.borrow().len(), 1);
        assert!(seen.borrow()[0].contains("list files"));
    }
}
