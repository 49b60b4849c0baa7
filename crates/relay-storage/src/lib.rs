//! Storage Kernel (C1): transactional persistence for jobs, asks, answers,
//! events, artifact metadata, and the decision cache (spec.md §4.1).
//!
//! Every other component reaches persisted state exclusively through the
//! [`Store`] trait. Two backends are provided: [`MemoryStore`] (`--storage
//! memory`, and the backend the rest of the workspace's test suites use)
//! and [`SqliteStore`] (`--storage sqlite`, WAL-journaled via `rusqlite`).

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod memory;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{JobListFilter, JobStateUpdate, Store};
