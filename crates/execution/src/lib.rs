//! Execution layer - dependency merging, run lifecycle, submission and polling.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod retry;

pub mod merge;
pub mod lifecycle;
pub mod poller;
pub mod dispatcher;

pub mod executor;
pub mod catalog;

pub use config::{EngineConfig, RetryPolicy};
pub use error::{EngineError, Result};
pub use merge::{MergeAction, MergeEngine, MergeOutcome};
pub use lifecycle::{advance_record, LifecycleController};
pub use poller::StatusPoller;
pub use dispatcher::Dispatcher;
pub use executor::{
    ExecutorAdapter, ExecutorError, InMemoryExecutor, JournalExecutor, StepEntry, StepReport, SubmitRequest,
    Submission,
};
pub use catalog::{CatalogError, JobCatalog, JobEntry, UpstreamCompletion};
