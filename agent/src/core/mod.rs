//! Pure, deterministic logic: types, budgets, policy, diffing, templating.
//!
//! Nothing in this module performs I/O. Time enters only as explicit
//! [`std::time::Instant`] arguments so every component is testable without a
//! real clock.

pub mod budget;
pub mod diff;
pub mod policy;
pub mod template;
pub mod transcript;
pub mod types;
