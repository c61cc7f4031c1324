//! Autonomous task execution: goals in, bounded tool use out.
//!
//! The crate splits into pure logic and side effects:
//!
//! - `core/`: types, budgets, policy, unified-diff application, transcript
//!   storage, and step templating. Deterministic, no I/O.
//! - `io/`: the capability traits (clock, shell, filesystem, LLM) and their
//!   production implementations.
//! - `runner`: executes one step behind the budget and policy gates.
//! - `planner` + `planexec`: plan a goal once, then execute linearly.
//! - `react`: decide one action per model turn, with guards against
//!   repetition and malformed output.
//!
//! Budget and policy refusals are hard stops: they surface as errors
//! downcastable to [`core::budget::BudgetExceededError`] and
//! [`core::policy::PolicyDeniedError`]. Tool-level problems are soft
//! failures recorded in the step result.

use anyhow::Result;

use crate::io::clock::CancelToken;

pub mod core;
pub mod io;
pub mod logging;
pub mod planexec;
pub mod planner;
pub mod react;
pub mod runner;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

/// A strategy that drives tool use toward a goal and returns the final
/// answer.
pub trait Agent {
    fn run_goal(&mut self, cancel: &CancelToken, goal: &str) -> Result<String>;
}
