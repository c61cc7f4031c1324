//! Resource accounting for a single run.
//!
//! A budget is consulted before every chargeable action and refuses once a
//! limit is reached. Wall time is always checked before any counter so a run
//! that is out of time cannot keep consuming other resources. All limits
//! default to zero, which means unlimited.

use std::cell::Cell;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::core::types::ToolKind;

/// Which budget dimension was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BudgetKind {
    Steps,
    ShellCalls,
    LlmCalls,
    FileOps,
    LlmTokens,
    WallTime,
    Iterations,
}

impl BudgetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BudgetKind::Steps => "steps",
            BudgetKind::ShellCalls => "shell",
            BudgetKind::LlmCalls => "llm",
            BudgetKind::FileOps => "files",
            BudgetKind::LlmTokens => "llm_tokens",
            BudgetKind::WallTime => "wall_time",
            BudgetKind::Iterations => "iterations",
        }
    }
}

impl std::fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a chargeable action would exceed a limit. The failing action
/// is refused and counters are left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetExceededError {
    #[error("{message}: kind={kind} limit={limit} used={used}")]
    Calls {
        kind: BudgetKind,
        limit: u64,
        used: u64,
        message: &'static str,
    },
    #[error("{message}: limit={limit:?} elapsed={elapsed:?}")]
    WallTime {
        limit: Duration,
        elapsed: Duration,
        message: &'static str,
    },
}

impl BudgetExceededError {
    pub fn kind(&self) -> BudgetKind {
        match self {
            BudgetExceededError::Calls { kind, .. } => *kind,
            BudgetExceededError::WallTime { .. } => BudgetKind::WallTime,
        }
    }
}

/// Limits for one run. Zero means unlimited for every field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BudgetLimits {
    pub max_steps: u64,
    pub max_wall_time: Duration,
    pub max_llm_tokens: u64,
    pub max_shell_calls: u64,
    pub max_llm_calls: u64,
    pub max_file_ops: u64,
    pub max_iterations: u64,
}

/// Point-in-time view of budget consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetSnapshot {
    pub started_at: Instant,
    pub elapsed: Duration,
    pub limits: BudgetLimits,
    pub steps_used: u64,
    pub shell_calls_used: u64,
    pub llm_calls_used: u64,
    pub file_ops_used: u64,
    pub llm_tokens_used: u64,
    pub iterations_used: u64,
}

/// Gatekeeper consulted before chargeable actions.
///
/// `now` is always passed in so implementations stay deterministic under a
/// manual clock.
pub trait Budget {
    /// Marks the start of the run. Idempotent; every `allow_*` call also
    /// starts the budget lazily on first use.
    fn start(&self, now: Instant);
    fn allow_step(&self, now: Instant) -> Result<(), BudgetExceededError>;
    fn allow_tool(&self, tool: ToolKind, now: Instant) -> Result<(), BudgetExceededError>;
    fn allow_iteration(&self, now: Instant) -> Result<(), BudgetExceededError>;
    /// Records actual token usage after an LLM call. Non-positive counts are
    /// ignored.
    fn charge_llm_tokens(&self, tokens: u64, now: Instant);
    fn snapshot(&self, now: Instant) -> BudgetSnapshot;
}

/// Production [`Budget`]: interior-mutable counters behind `&self`.
///
/// Uses `Cell`, so the type is `!Sync` by construction: one run owns one
/// budget and shares it via `Rc`.
#[derive(Debug)]
pub struct CallBudget {
    limits: BudgetLimits,
    started_at: Cell<Option<Instant>>,
    steps_used: Cell<u64>,
    shell_calls_used: Cell<u64>,
    llm_calls_used: Cell<u64>,
    file_ops_used: Cell<u64>,
    llm_tokens_used: Cell<u64>,
    iterations_used: Cell<u64>,
}

impl CallBudget {
    pub fn new(limits: BudgetLimits) -> Self {
        CallBudget {
            limits,
            started_at: Cell::new(None),
            steps_used: Cell::new(0),
            shell_calls_used: Cell::new(0),
            llm_calls_used: Cell::new(0),
            file_ops_used: Cell::new(0),
            llm_tokens_used: Cell::new(0),
            iterations_used: Cell::new(0),
        }
    }

    /// Unlimited budget; every check passes.
    pub fn unlimited() -> Self {
        CallBudget::new(BudgetLimits::default())
    }

    fn ensure_started(&self, now: Instant) -> Instant {
        match self.started_at.get() {
            Some(t) => t,
            None => {
                self.started_at.set(Some(now));
                now
            }
        }
    }

    fn check_wall_time(&self, now: Instant) -> Result<(), BudgetExceededError> {
        let started = self.ensure_started(now);
        if self.limits.max_wall_time == Duration::ZERO {
            return Ok(());
        }
        let elapsed = now.saturating_duration_since(started);
        if elapsed > self.limits.max_wall_time {
            return Err(BudgetExceededError::WallTime {
                limit: self.limits.max_wall_time,
                elapsed,
                message: "wall time budget exceeded",
            });
        }
        Ok(())
    }

    /// Admits one more use of a counter, or refuses without incrementing.
    fn charge_counter(
        counter: &Cell<u64>,
        limit: u64,
        kind: BudgetKind,
        message: &'static str,
    ) -> Result<(), BudgetExceededError> {
        let used = counter.get();
        if limit > 0 && used + 1 > limit {
            return Err(BudgetExceededError::Calls { kind, limit, used, message });
        }
        counter.set(used + 1);
        Ok(())
    }
}

impl Budget for CallBudget {
    fn start(&self, now: Instant) {
        self.ensure_started(now);
    }

    fn allow_step(&self, now: Instant) -> Result<(), BudgetExceededError> {
        self.check_wall_time(now)?;
        Self::charge_counter(
            &self.steps_used,
            self.limits.max_steps,
            BudgetKind::Steps,
            "step budget exceeded",
        )
    }

    fn allow_tool(&self, tool: ToolKind, now: Instant) -> Result<(), BudgetExceededError> {
        self.check_wall_time(now)?;
        match tool {
            ToolKind::Shell => Self::charge_counter(
                &self.shell_calls_used,
                self.limits.max_shell_calls,
                BudgetKind::ShellCalls,
                "shell call budget exceeded",
            ),
            ToolKind::Llm => Self::charge_counter(
                &self.llm_calls_used,
                self.limits.max_llm_calls,
                BudgetKind::LlmCalls,
                "llm call budget exceeded",
            ),
            ToolKind::File => Self::charge_counter(
                &self.file_ops_used,
                self.limits.max_file_ops,
                BudgetKind::FileOps,
                "file op budget exceeded",
            ),
        }
    }

    fn allow_iteration(&self, now: Instant) -> Result<(), BudgetExceededError> {
        self.check_wall_time(now)?;
        Self::charge_counter(
            &self.iterations_used,
            self.limits.max_iterations,
            BudgetKind::Iterations,
            "iteration budget exceeded",
        )
    }

    fn charge_llm_tokens(&self, tokens: u64, now: Instant) {
        self.ensure_started(now);
        if tokens == 0 {
            return;
        }
        self.llm_tokens_used.set(self.llm_tokens_used.get() + tokens);
    }

    fn snapshot(&self, now: Instant) -> BudgetSnapshot {
        let started = self.ensure_started(now);
        BudgetSnapshot {
            started_at: started,
            elapsed: now.saturating_duration_since(started),
            limits: self.limits,
            steps_used: self.steps_used.get(),
            shell_calls_used: self.shell_calls_used.get(),
            llm_calls_used: self.llm_calls_used.get(),
            file_ops_used: self.file_ops_used.get(),
            llm_tokens_used: self.llm_tokens_used.get(),
            iterations_used: self.iterations_used.get(),
        }
    }
}
