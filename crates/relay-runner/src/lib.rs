//! Answer Runner (C6): the LLM-backed component that turns Asks into
//! Answers (spec.md §4.6).
//!
//! Four layers, each in its own module:
//! - [`role`] loads the YAML-configured personas the runner picks among.
//! - [`prompt`] assembles a role's fixed system prompt and the Ask's own
//!   question into one fully-resolved, fingerprinted prompt.
//! - [`client`] is the pluggable call-out to an actual LLM.
//! - [`runner`] is the orchestration tying context verification, the
//!   decision cache, role resolution, the LLM call with schema-guarded
//!   retries, tool-policy enforcement, and attestation together.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod prompt;
pub mod role;
pub mod runner;

pub use client::{HttpLlmClient, LlmClient, LlmRequest, LlmResponse};
pub use prompt::AssembledPrompt;
pub use role::{Role, RoleStore};
pub use runner::{AnswerRunner, AnswerRunnerConfig};
