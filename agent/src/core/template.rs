//! Step-field templating against accumulated execution state.
//!
//! Plan steps may interpolate the run goal and outputs of earlier steps into
//! their text fields (`{{ goal }}`, `{{ results[0].output }}`). Rendering is
//! strict: an unknown variable is an error, not empty text. Validation runs
//! at plan time and rejects any `results[...]` reference that is not a
//! literal integer pointing at an earlier step, so a plan can never read
//! output that will not exist yet.

use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use minijinja::{Environment, UndefinedBehavior, Value};
use regex::Regex;

use crate::core::types::{ExecContext, Step, ToolKind};

static RESULTS_INDEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bresults\s*\[\s*(\d+)\s*\]").expect("results index regex"));
static RESULTS_ACCESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bresults\s*\[").expect("results access regex"));

fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env
}

fn has_template_markers(text: &str) -> bool {
    text.contains("{{") || text.contains("{%")
}

/// The templated text fields of a step, by kind.
fn templated_fields(step: &Step) -> Vec<(&'static str, &str)> {
    let mut fields = vec![("description", step.description.as_str())];
    match step.kind {
        ToolKind::Shell => {
            fields.push(("command", step.command.as_str()));
            for arg in &step.args {
                fields.push(("args", arg.as_str()));
            }
        }
        ToolKind::Llm => fields.push(("prompt", step.prompt.as_str())),
        ToolKind::File => {
            fields.push(("op", step.op.as_str()));
            fields.push(("path", step.path.as_str()));
            fields.push(("data", step.data.as_str()));
        }
    }
    fields
}

/// Renders every templated field of `step` against `ctx`, returning the
/// concrete step. Fields without template markers pass through untouched.
pub fn render_step(step: &Step, ctx: &ExecContext) -> Result<Step> {
    let env = environment();
    let value = Value::from_serialize(ctx);
    let mut rendered = step.clone();

    rendered.description = render_field(&env, "description", &step.description, &value)?;
    match step.kind {
        ToolKind::Shell => {
            rendered.command = render_field(&env, "command", &step.command, &value)?;
            for (i, arg) in step.args.iter().enumerate() {
                rendered.args[i] = render_field(&env, "args", arg, &value)?;
            }
        }
        ToolKind::Llm => {
            rendered.prompt = render_field(&env, "prompt", &step.prompt, &value)?;
        }
        ToolKind::File => {
            rendered.op = render_field(&env, "op", &step.op, &value)?;
            rendered.path = render_field(&env, "path", &step.path, &value)?;
            rendered.data = render_field(&env, "data", &step.data, &value)?;
        }
    }
    Ok(rendered)
}

fn render_field(env: &Environment<'_>, name: &str, source: &str, ctx: &Value) -> Result<String> {
    if !has_template_markers(source) {
        return Ok(source.to_string());
    }
    env.render_str(source, ctx)
        .with_context(|| format!("rendering {name} template"))
}

/// Statically validates the templates of the step at `index` in a plan:
/// syntax must parse, and every `results[...]` access must use a literal
/// integer index referring to a step that runs earlier.
pub fn validate_step_templates(index: usize, step: &Step) -> Result<()> {
    let env = environment();
    for (name, source) in templated_fields(step) {
        if !has_template_markers(source) {
            continue;
        }
        env.template_from_str(source)
            .with_context(|| format!("step {index}: invalid {name} template"))?;

        let literal_refs = RESULTS_INDEX_RE.find_iter(source).count();
        let all_refs = RESULTS_ACCESS_RE.find_iter(source).count();
        if all_refs != literal_refs {
            bail!("step {index} {name}: results[...] requires a literal integer index");
        }
        for caps in RESULTS_INDEX_RE.captures_iter(source) {
            let n: usize = caps[1]
                .parse()
                .with_context(|| format!("step {index} {name}: results index"))?;
            if n >= index {
                bail!(
                    "step {index} {name}: references results[{n}] but only prior results are available (max index {})",
                    index as i64 - 1
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::types::{OutcomeKind, StepResult};

    fn ctx_with_result(goal: &str, output: &str) -> ExecContext {
        let step = Step::shell("list", "ls", &[]);
        ExecContext {
            goal: goal.to_string(),
            plan: crate::core::types::Plan { goal: goal.to_string(), steps: vec![step.clone()] },
            results: vec![StepResult {
                step,
                outcome: OutcomeKind::Ok,
                output: output.to_string(),
                transcript: String::new(),
                duration: Duration::ZERO,
                exec: None,
                effects: Vec::new(),
            }],
        }
    }

    /// Verifies fields without template markers pass through byte-identical.
    #[test]
    fn plain_fields_pass_through() {
        let step = Step::llm("summarize {not a template}", "plain prompt");
        let rendered = render_step(&step, &ExecContext::default()).unwrap();
        assert_eq!(rendered, step);
    }

    /// Verifies goal and prior-result interpolation.
    #[test]
    fn renders_goal_and_results() {
        let ctx = ctx_with_result("tidy the repo", "README.md\nsrc\n");
        let step = Step::llm(
            "summarize for {{ goal }}",
            "Summarize this listing:\n{{ results[0].output }}",
        );
        let rendered = render_step(&step, &ctx).unwrap();
        assert_eq!(rendered.description, "summarize for tidy the repo");
        assert_eq!(rendered.prompt, "Summarize this listing:\nREADME.md\nsrc\n");
    }

    /// Verifies shell args render individually.
    #[test]
    fn renders_shell_args() {
        let ctx = ctx_with_result("goal", "target.txt");
        let step = Step::shell("cat result", "cat", &["{{ results[0].output }}"]);
        let rendered = render_step(&step, &ctx).unwrap();
        assert_eq!(rendered.args, vec!["target.txt".to_string()]);
    }

    /// Verifies strict mode: an unknown variable is a render error, not an
    /// empty substitution.
    #[test]
    fn unknown_variable_errors() {
        let step = Step::llm("ask", "{{ nonsense }}");
        let err = render_step(&step, &ExecContext::default()).unwrap_err();
        assert!(err.to_string().contains("prompt template"));
    }

    /// Verifies a self- or forward-reference is rejected with the available
    /// range in the message.
    #[test]
    fn forward_reference_rejected() {
        let step = Step::llm("ask", "{{ results[1].output }}");
        let err = validate_step_templates(1, &step).unwrap_err();
        assert!(
            err.to_string()
                .contains("references results[1] but only prior results are available (max index 0)")
        );

        let step = Step::llm("ask", "{{ results[0].output }}");
        let err = validate_step_templates(0, &step).unwrap_err();
        assert!(err.to_string().contains("max index -1"));
    }

    /// Verifies a backward reference validates.
    #[test]
    fn backward_reference_accepted() {
        let step = Step::llm("ask", "{{ results[0].output }} and {{ results[1].output }}");
        validate_step_templates(2, &step).unwrap();
    }

    /// Verifies non-literal result indices are rejected even though the
    /// template engine could evaluate them.
    #[test]
    fn dynamic_index_rejected() {
        let step = Step::llm("ask", "{% for r in results %}{{ results[loop.index0] }}{% endfor %}");
        let err = validate_step_templates(3, &step).unwrap_err();
        assert!(err.to_string().contains("literal integer index"));
    }

    /// Verifies an unrelated identifier that merely ends in `results` is not
    /// mistaken for a results reference.
    #[test]
    fn similar_identifier_is_not_a_results_reference() {
        let step = Step::llm("ask", "{{ myresults[5].output }}");
        validate_step_templates(0, &step).unwrap();
    }

    /// Verifies template syntax errors are caught at validation time.
    #[test]
    fn syntax_error_rejected() {
        let step = Step::llm("ask", "{{ goal");
        let err = validate_step_templates(1, &step).unwrap_err();
        assert!(err.to_string().contains("invalid prompt template"));
    }
}
