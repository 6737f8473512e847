//! Dependency merge engine.
//!
//! Folds one notification into the latest generation of a (job, snapshot):
//!
//! ```text
//! empty map            -> new DISABLED version
//! no version yet       -> version 1, WAITING
//! latest is WAITING    -> fill open slots in place
//! latest is past that  -> roll over to a new WAITING version
//! ```
//!
//! Afterwards a WAITING record whose slots are all filled moves to
//! `DEPS_COMPLETE`. Every write is conditional, so two notifications racing
//! on the same record cannot lose either update.

use std::sync::Arc;
use chrono::NaiveDate;
use depgate_core::{DependencyMap, JobName, RunAttribute, RunKey, RunRecord, RunStatus, Version};
use depgate_storage::{AuditStore, Precondition, RunDraft};
use tracing::{debug, info};

use crate::config::RetryPolicy;
use crate::error::Result;
use crate::retry::retry_on_conflict;

/// What a merge did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    /// Empty notification; a DISABLED version was appended
    Disabled,
    /// First version created
    Created,
    /// Open slots of the WAITING version were filled
    Merged,
    /// Nothing new for the WAITING version
    Unchanged,
    /// Latest version had moved on; a new generation was started
    RolledOver,
}

/// Result of merging one notification.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Record as stored after the merge (and any completion transition)
    pub record: RunRecord,

    /// Branch taken
    pub action: MergeAction,
}

impl MergeOutcome {
    /// Version the notification landed in.
    pub fn version(&self) -> Version {
        self.record.key.version
    }

    /// Status after the merge.
    pub fn status(&self) -> RunStatus {
        self.record.status
    }

    /// Merged dependency map.
    pub fn dependencies(&self) -> &DependencyMap {
        &self.record.dependencies
    }
}

/// Merges dependency notifications into run records.
pub struct MergeEngine {
    store: Arc<dyn AuditStore>,
    retry: RetryPolicy,
}

impl MergeEngine {
    /// Create an engine over `store`.
    pub fn new(store: Arc<dyn AuditStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Merge `incoming` into the latest generation for (job, snapshot).
    pub async fn merge_dependency(
        &self,
        job_name: &JobName,
        snapshot_date: NaiveDate,
        incoming: &DependencyMap,
    ) -> Result<MergeOutcome> {
        let (record, action) = retry_on_conflict(&self.retry, "merge dependency", || {
            self.apply_incoming(job_name, snapshot_date, incoming)
        })
        .await?;

        let record = if record.status == RunStatus::Waiting {
            let key = &record.key;
            retry_on_conflict(&self.retry, "complete dependencies", || self.complete_if_satisfied(key)).await?
        } else {
            record
        };

        Ok(MergeOutcome { record, action })
    }

    async fn apply_incoming(
        &self,
        job_name: &JobName,
        snapshot_date: NaiveDate,
        incoming: &DependencyMap,
    ) -> Result<(RunRecord, MergeAction)> {
        if incoming.is_empty() {
            let draft = RunDraft::new(DependencyMap::new(), RunStatus::Disabled);
            let record = self.store.insert_version(job_name, snapshot_date, draft).await?;
            info!("Job disabled {} ({})", job_name, record.key.versioned_key());
            return Ok((record, MergeAction::Disabled));
        }

        let Some(latest) = self.store.latest_record(job_name, snapshot_date).await? else {
            let draft = RunDraft::new(incoming.clone(), RunStatus::Waiting)
                .with_precondition(Precondition::NoneExist);
            let record = self.store.insert_version(job_name, snapshot_date, draft).await?;
            info!(run = %record.key, open = ?record.dependencies.unfulfilled(), "created first run version");
            return Ok((record, MergeAction::Created));
        };

        if latest.status == RunStatus::Waiting {
            let mut dependencies = latest.dependencies.clone();
            if !dependencies.fill_open_slots(incoming) {
                debug!(run = %latest.key, "notification adds nothing to waiting run");
                return Ok((latest, MergeAction::Unchanged));
            }
            let record = self
                .store
                .update_attribute(&latest.key, latest.revision, RunAttribute::Dependencies(dependencies))
                .await?;
            debug!(run = %record.key, open = ?record.dependencies.unfulfilled(), "merged dependencies");
            return Ok((record, MergeAction::Merged));
        }

        let seeded = latest.dependencies.overlaid_with(incoming);
        let draft = RunDraft::new(seeded, RunStatus::Waiting)
            .with_precondition(Precondition::LatestIs(latest.key.version));
        let record = self.store.insert_version(job_name, snapshot_date, draft).await?;
        info!(
            run = %record.key,
            previous = %latest.key.version,
            previous_status = %latest.status,
            "rolled over to new run version"
        );
        Ok((record, MergeAction::RolledOver))
    }

    /// Move a WAITING record with no open slots to `DEPS_COMPLETE`.
    async fn complete_if_satisfied(&self, key: &RunKey) -> Result<RunRecord> {
        let record = self.store.get_record(key).await?;
        if record.status != RunStatus::Waiting || !record.dependencies.is_complete() {
            return Ok(record);
        }
        let record = self
            .store
            .update_attribute(key, record.revision, RunAttribute::Status(RunStatus::DepsComplete))
            .await?;
        info!(run = %record.key, "all dependencies fulfilled");
        Ok(record)
    }
}
