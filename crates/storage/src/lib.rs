//! Audit store abstraction and implementations for depgate.
//!
//! This crate provides a trait-based store for versioned run records with an
//! in-memory backend, a JSON file backend, and an optional SQLite backend.

#![warn(missing_docs)]

pub mod trait_;
pub mod memory;
#[cfg(feature = "json")]
pub mod json_storage;
#[cfg(feature = "sqlite")]
pub mod sqlite_storage;

pub use trait_::{apply_conditional, AuditStore, Precondition, Result, RunDraft, StorageError};
pub use memory::InMemoryAuditStore;
#[cfg(feature = "json")]
pub use json_storage::JsonAuditStore;
#[cfg(feature = "sqlite")]
pub use sqlite_storage::SqliteAuditStore;
