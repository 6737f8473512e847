//! depgate core data models.
//!
//! This crate defines the run records, dependency maps, inbound events and
//! outbound directives shared by the audit store and the execution layer.

#![warn(missing_docs)]

// Identities
mod id;

// Run state
mod dependency;
mod run;

// Boundary types
mod directive;
mod event;

// Re-exports
pub use id::{parse_snapshot_date, IdError, JobName, RunKey, Version, MAX_JOB_NAME_LEN};
pub use dependency::{DependencyMap, Fulfillment};
pub use run::{RunAttribute, RunRecord, RunStatus};
pub use directive::{Directive, StepStatus};
pub use event::{DecodeError, InboundEvent};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
