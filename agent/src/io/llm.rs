//! LLM completion transport.
//!
//! The crate only depends on this trait; the concrete backend (an API
//! client, a local process, a scripted double) is injected by the caller.
//! `test_support` ships [`crate::test_support::ScriptedLlm`].

use anyhow::Result;

use crate::io::clock::CancelToken;

/// One completion: the text plus the token count the backend reports for the
/// whole call. A backend without usage reporting may return zero tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub tokens_used: u64,
}

/// Text-completion capability used by LLM steps, planners, and agents.
pub trait Llm {
    fn complete(&self, cancel: &CancelToken, prompt: &str) -> Result<Completion>;
}
