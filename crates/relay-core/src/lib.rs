//! Domain model for the task-relay scheduler.
//!
//! Defines the entities, enumerations, and state-transition rules fixed by
//! spec.md §3/§4.2/§4.3: [`Job`], [`JobSpec`], [`Ask`], [`Answer`],
//! [`DecisionCacheEntry`], [`Event`], [`ArtifactMeta`], the branded id
//! newtypes, and `stableHashContext` canonicalization.
//!
//! This crate is pure data plus pure functions — no I/O, no async. The
//! Storage Kernel (`relay-storage`), Job Manager (`relay-manager`), and
//! every other component build on these types without redefining them.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod answer;
pub mod artifact;
pub mod ask;
pub mod decision_cache;
pub mod envelope;
pub mod event;
pub mod hash;
pub mod ids;
pub mod job;
pub mod validate;

pub use answer::{Answer, AnswerPayload, Attestation};
pub use artifact::{ArtifactKind, ArtifactMeta};
pub use ask::{Ask, AskConstraints, AskPayload, AskStatus, AskType};
pub use decision_cache::{DecisionCacheEntry, DEFAULT_TTL_SECONDS};
pub use envelope::{ContextEnvelope, JobSnapshot};
pub use event::{Event, RelayEvent};
pub use hash::{canonical_json, decision_key, sha256_hex, stable_hash_context};
pub use ids::{generate_job_id, AskId, CommitHash, JobId, LeaseOwner};
pub use job::{
    ExecutionSpec, Job, JobContext, JobSpec, JobState, OutputKind, Priority, ReasonCode, RepoRef,
    ScopeSpec, TaskSpec,
};
