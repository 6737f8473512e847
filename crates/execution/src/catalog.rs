//! Job catalog - which jobs wait on which upstream datasets.
//!
//! Loaded from a JSON document keyed by job name:
//!
//! ```json
//! { "daily_report": { "job_dependencies": ["orders", "users"], "active": true } }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use chrono::NaiveDate;
use depgate_core::{DependencyMap, Fulfillment, IdError, InboundEvent, JobName};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Catalog loading errors.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A catalog key is not a valid job name
    #[error("invalid job {name:?}: {source}")]
    InvalidJob {
        /// Offending key
        name: String,
        /// Validation failure
        source: IdError,
    },
}

/// Catalog entry for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEntry {
    /// Upstream datasets the job waits on
    #[serde(default)]
    pub job_dependencies: Vec<String>,

    /// Inactive jobs are disabled on every notification
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// An upstream dataset finished a run for a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamCompletion {
    /// Dataset (dependency name) that completed
    pub dataset: String,

    /// Snapshot it completed for
    pub snapshot_date: NaiveDate,

    /// Token handed to downstream jobs
    pub fulfillment: Fulfillment,
}

/// Registry of jobs and their dependencies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobCatalog {
    jobs: BTreeMap<JobName, JobEntry>,
}

impl JobCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a job.
    pub fn with_job(mut self, job_name: JobName, entry: JobEntry) -> Self {
        self.jobs.insert(job_name, entry);
        self
    }

    /// Parse a catalog document.
    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        let raw: BTreeMap<String, JobEntry> = serde_json::from_str(json)?;
        let mut jobs = BTreeMap::new();
        for (name, entry) in raw {
            let job_name = JobName::new(name.clone()).map_err(|source| CatalogError::InvalidJob { name, source })?;
            jobs.insert(job_name, entry);
        }
        Ok(Self { jobs })
    }

    /// Load a catalog file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let json = tokio::fs::read_to_string(path.as_ref()).await?;
        let catalog = Self::from_json_str(&json)?;
        debug!(path = %path.as_ref().display(), jobs = catalog.jobs.len(), "loaded job catalog");
        Ok(catalog)
    }

    /// Number of jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether the catalog has no jobs.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Entry for a job.
    pub fn get(&self, job_name: &JobName) -> Option<&JobEntry> {
        self.jobs.get(job_name)
    }

    /// Jobs listing `dataset` as a dependency, active or not, sorted.
    pub fn jobs_by_dependency(&self, dataset: &str) -> Vec<JobName> {
        self.jobs
            .iter()
            .filter(|(_, entry)| entry.job_dependencies.iter().any(|d| d == dataset))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Dependencies of an active job; empty for inactive or unknown jobs.
    pub fn dependencies_of(&self, job_name: &JobName) -> Vec<String> {
        match self.jobs.get(job_name) {
            Some(entry) if entry.active => entry.job_dependencies.clone(),
            _ => Vec::new(),
        }
    }

    /// One notification per downstream job of the completed dataset.
    pub fn expand(&self, completion: &UpstreamCompletion) -> Vec<InboundEvent> {
        self.jobs_by_dependency(&completion.dataset)
            .into_iter()
            .map(|job_name| {
                let dependencies: DependencyMap = self
                    .dependencies_of(&job_name)
                    .into_iter()
                    .map(|dep| {
                        let value = (dep == completion.dataset).then(|| completion.fulfillment.clone());
                        (dep, value)
                    })
                    .collect();
                InboundEvent::DependencyNotification {
                    job_name,
                    snapshot_date: completion.snapshot_date,
                    dependencies,
                }
            })
            .collect()
    }
}
