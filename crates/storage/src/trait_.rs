//! Audit store trait abstraction.

use async_trait::async_trait;
use chrono::NaiveDate;
use depgate_core::{DependencyMap, JobName, RunAttribute, RunKey, RunRecord, RunStatus, Version};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backend unreachable or failing
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The record or version sequence changed since it was read
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),
}

impl StorageError {
    /// Whether the error means the backend could not complete the operation.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Json(_) | Self::Unavailable(_))
    }
}

/// Condition on the version sequence for an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Always allocate the next version
    Any,
    /// Only when no version exists yet
    NoneExist,
    /// Only when the latest version is still this one
    LatestIs(Version),
}

impl Precondition {
    /// Check the precondition against the current latest version.
    pub fn check(self, job_name: &JobName, snapshot_date: NaiveDate, latest: Option<Version>) -> Result<()> {
        let holds = match self {
            Self::Any => true,
            Self::NoneExist => latest.is_none(),
            Self::LatestIs(expected) => latest == Some(expected),
        };
        if holds {
            Ok(())
        } else {
            Err(StorageError::ConcurrentModification(format!(
                "{job_name}@{snapshot_date}: expected {self:?}, latest is {}",
                latest.map_or_else(|| "none".to_string(), |v| v.to_string())
            )))
        }
    }
}

/// Initial attributes of a new generation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunDraft {
    /// Starting dependency map
    pub dependencies: DependencyMap,

    /// Starting status
    pub status: RunStatus,

    /// Condition for allocating the version
    pub precondition: Precondition,
}

impl RunDraft {
    /// Draft allocated unconditionally.
    pub fn new(dependencies: DependencyMap, status: RunStatus) -> Self {
        Self {
            dependencies,
            status,
            precondition: Precondition::Any,
        }
    }

    /// Set the allocation precondition.
    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    /// Materialize the draft as the record for `key`.
    pub fn into_record(self, key: RunKey) -> RunRecord {
        RunRecord::new(key, self.dependencies, self.status)
    }
}

/// Apply a conditional update to an in-memory copy of a record.
pub fn apply_conditional(record: &mut RunRecord, expected_revision: u64, attribute: RunAttribute) -> Result<()> {
    if record.revision != expected_revision {
        return Err(StorageError::ConcurrentModification(format!(
            "{}: expected revision {expected_revision}, found {}",
            record.key, record.revision
        )));
    }
    record.apply(attribute);
    Ok(())
}

/// Durable store of versioned run records.
///
/// Every mutation of an existing record is conditioned on its revision, and
/// version allocation can be conditioned on the latest version, so concurrent
/// invocations never overwrite each other silently.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Allocate the next version for (job, snapshot) and write its initial
    /// attributes atomically.
    async fn insert_version(
        &self,
        job_name: &JobName,
        snapshot_date: NaiveDate,
        draft: RunDraft,
    ) -> Result<RunRecord>;

    /// All versions for (job, snapshot), ascending.
    async fn get_records(&self, job_name: &JobName, snapshot_date: NaiveDate) -> Result<Vec<RunRecord>>;

    /// One version; `NotFound` if absent.
    async fn get_record(&self, key: &RunKey) -> Result<RunRecord>;

    /// Update one attribute if the record is still at `expected_revision`.
    async fn update_attribute(
        &self,
        key: &RunKey,
        expected_revision: u64,
        attribute: RunAttribute,
    ) -> Result<RunRecord>;

    /// Every tracked (job, snapshot) pair.
    async fn list_runs(&self) -> Result<Vec<(JobName, NaiveDate)>>;

    /// The highest version for (job, snapshot), if any.
    async fn latest_record(&self, job_name: &JobName, snapshot_date: NaiveDate) -> Result<Option<RunRecord>> {
        let records = self.get_records(job_name, snapshot_date).await?;
        Ok(records.into_iter().max_by_key(|r| r.key.version))
    }
}
