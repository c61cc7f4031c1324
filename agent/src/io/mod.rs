//! Side-effecting capabilities: clock, shell, filesystem, and LLM transport.
//!
//! Everything here sits behind a trait so the orchestration layers stay
//! testable with scripted doubles.

pub mod clock;
pub mod files;
pub mod llm;
pub mod shell;
