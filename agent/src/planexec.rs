//! Plan-then-execute agent: one planning call, then linear step execution.

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::Agent;
use crate::core::template::render_step;
use crate::core::transcript::TranscriptBuffer;
use crate::core::types::{Config, ExecContext, OutcomeKind};
use crate::io::clock::CancelToken;
use crate::planner::Planner;
use crate::runner::Runner;

/// Cap on an agent run's accumulated transcript.
pub const AGENT_TRANSCRIPT_BYTES: usize = 512 * 1024;

/// Executes a plan front to back. Each step is rendered against the outputs
/// of the steps before it, then run; the first failing step aborts the run.
pub struct PlanExecuteAgent {
    planner: Box<dyn Planner>,
    runner: Box<dyn Runner>,
    config: Config,
    transcript: TranscriptBuffer,
}

impl PlanExecuteAgent {
    pub fn new(planner: Box<dyn Planner>, runner: Box<dyn Runner>, config: Config) -> Self {
        PlanExecuteAgent {
            planner,
            runner,
            config,
            transcript: TranscriptBuffer::new(AGENT_TRANSCRIPT_BYTES),
        }
    }

    /// The accumulated run transcript.
    pub fn transcript(&self) -> String {
        self.transcript.contents()
    }
}

impl Agent for PlanExecuteAgent {
    #[instrument(skip_all, fields(goal_len = goal.len()))]
    fn run_goal(&mut self, cancel: &CancelToken, goal: &str) -> Result<String> {
        let goal = goal.trim();
        let plan = self.planner.plan(cancel, goal)?;
        info!(steps = plan.steps.len(), "executing plan");

        let mut ctx = ExecContext {
            goal: goal.to_string(),
            plan: plan.clone(),
            results: Vec::new(),
        };
        let mut final_output = String::new();

        for (i, step) in plan.steps.iter().enumerate() {
            cancel.err_if_cancelled()?;
            let rendered = render_step(step, &ctx)
                .with_context(|| format!("step {i} ({})", step.description))?;
            debug!(i, kind = %rendered.kind, description = %rendered.description, "running step");

            let result = self.runner.run_step(cancel, &self.config, &rendered)?;
            self.transcript.append(&result.transcript);

            if result.outcome == OutcomeKind::Error {
                warn!(i, "step failed, aborting plan");
                bail!("step failed: {}", rendered.description);
            }
            if !result.output.trim().is_empty() {
                final_output = result.output.clone();
            }
            ctx.results.push(result);
        }

        info!("plan complete");
        Ok(final_output.trim_end().to_string())
    }
}
