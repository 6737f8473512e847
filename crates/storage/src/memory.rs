//! In-memory audit store for tests and embedding.

use async_trait::async_trait;
use chrono::NaiveDate;
use depgate_core::{JobName, RunAttribute, RunKey, RunRecord, Version};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use super::trait_::{apply_conditional, AuditStore, Result, RunDraft, StorageError};

type Generations = BTreeMap<(JobName, NaiveDate), Vec<RunRecord>>;

/// Audit store kept in process memory.
#[derive(Default)]
pub struct InMemoryAuditStore {
    runs: Mutex<Generations>,
    unavailable: AtomicBool,
}

impl InMemoryAuditStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `Unavailable` (failure injection).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("in-memory store switched off".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn insert_version(
        &self,
        job_name: &JobName,
        snapshot_date: NaiveDate,
        draft: RunDraft,
    ) -> Result<RunRecord> {
        self.check_available()?;
        let mut runs = self.runs.lock().await;
        let slot = (job_name.clone(), snapshot_date);

        let latest = runs
            .get(&slot)
            .and_then(|generations| generations.last())
            .map(|r| r.key.version);
        draft.precondition.check(job_name, snapshot_date, latest)?;

        let version = latest.map_or(Version::FIRST, Version::next);
        let record = draft.into_record(RunKey::new(job_name.clone(), snapshot_date, version));
        runs.entry(slot).or_default().push(record.clone());
        Ok(record)
    }

    async fn get_records(&self, job_name: &JobName, snapshot_date: NaiveDate) -> Result<Vec<RunRecord>> {
        self.check_available()?;
        let runs = self.runs.lock().await;
        Ok(runs
            .get(&(job_name.clone(), snapshot_date))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_record(&self, key: &RunKey) -> Result<RunRecord> {
        self.check_available()?;
        let runs = self.runs.lock().await;
        runs.get(&(key.job_name.clone(), key.snapshot_date))
            .and_then(|generations| generations.iter().find(|r| r.key.version == key.version))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn update_attribute(
        &self,
        key: &RunKey,
        expected_revision: u64,
        attribute: RunAttribute,
    ) -> Result<RunRecord> {
        self.check_available()?;
        let mut runs = self.runs.lock().await;
        let record = runs
            .get_mut(&(key.job_name.clone(), key.snapshot_date))
            .and_then(|generations| generations.iter_mut().find(|r| r.key.version == key.version))
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        apply_conditional(record, expected_revision, attribute)?;
        Ok(record.clone())
    }

    async fn list_runs(&self) -> Result<Vec<(JobName, NaiveDate)>> {
        self.check_available()?;
        let runs = self.runs.lock().await;
        Ok(runs.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trait_::Precondition;
    use depgate_core::{DependencyMap, RunStatus};

    fn job() -> JobName {
        JobName::new("test_job").unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 25).unwrap()
    }

    fn draft() -> RunDraft {
        RunDraft::new(DependencyMap::pending(["dep1"]), RunStatus::Waiting)
    }

    #[tokio::test]
    async fn test_versions_are_dense_and_increasing() {
        let store = InMemoryAuditStore::new();
        for expected in 1..=4 {
            let record = store.insert_version(&job(), date(), draft()).await.unwrap();
            assert_eq!(record.key.version.get(), expected);
            assert_eq!(record.revision, 1);
        }
        let records = store.get_records(&job(), date()).await.unwrap();
        let versions: Vec<u32> = records.iter().map(|r| r.key.version.get()).collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_insert_precondition() {
        let store = InMemoryAuditStore::new();
        store
            .insert_version(&job(), date(), draft().with_precondition(Precondition::NoneExist))
            .await
            .unwrap();
        let err = store
            .insert_version(&job(), date(), draft().with_precondition(Precondition::NoneExist))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ConcurrentModification(_)));

        let stale = Precondition::LatestIs(Version::new(7).unwrap());
        let err = store
            .insert_version(&job(), date(), draft().with_precondition(stale))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ConcurrentModification(_)));

        let fresh = Precondition::LatestIs(Version::FIRST);
        let record = store
            .insert_version(&job(), date(), draft().with_precondition(fresh))
            .await
            .unwrap();
        assert_eq!(record.key.version.get(), 2);
    }

    #[tokio::test]
    async fn test_update_is_conditional() {
        let store = InMemoryAuditStore::new();
        let record = store.insert_version(&job(), date(), draft()).await.unwrap();

        let updated = store
            .update_attribute(&record.key, 1, RunAttribute::Status(RunStatus::DepsComplete))
            .await
            .unwrap();
        assert_eq!(updated.revision, 2);
        assert_eq!(updated.status, RunStatus::DepsComplete);

        let err = store
            .update_attribute(&record.key, 1, RunAttribute::Status(RunStatus::Failed))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ConcurrentModification(_)));
        assert_eq!(store.get_record(&record.key).await.unwrap().status, RunStatus::DepsComplete);
    }

    #[tokio::test]
    async fn test_missing_record() {
        let store = InMemoryAuditStore::new();
        let key = RunKey::new(job(), date(), Version::FIRST);
        assert!(matches!(store.get_record(&key).await, Err(StorageError::NotFound(_))));
        assert!(store.latest_record(&job(), date()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = InMemoryAuditStore::new();
        store.set_unavailable(true);
        let err = store.get_records(&job(), date()).await.unwrap_err();
        assert!(err.is_unavailable());
        store.set_unavailable(false);
        assert!(store.list_runs().await.unwrap().is_empty());
    }
}
