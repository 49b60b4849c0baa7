//! Worker Pool (C4): sandboxed repo checkout, pluggable executor backend,
//! apply-check, and artifact writing (spec.md §4.4).
//!
//! This crate owns the lease-acquire / heartbeat / execute loop; every
//! state transition it causes is still routed through `relay_manager`'s
//! `JobManager` (or, for the `acquireLease`-driven move into `RUNNING`,
//! announced alongside the Storage Kernel's own write — see
//! [`pool::WorkerPool`]'s module docs) so the state machine guard in
//! `relay_core::job::JobState::can_transition_to` is never bypassed.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod artifacts;
pub mod backend;
pub mod pool;
pub mod repo;

pub use artifacts::{ArtifactStore, FsArtifactStore, WriteOutcome};
pub use backend::{BackendOutput, ExecutorBackend, SubprocessBackend};
pub use pool::{WorkerPool, WorkerPoolConfig};
