//! JSON file storage implementation.
//!
//! Stores every generation of a (job, snapshot) in one JSON file under
//! `<root>/runs/<job>/<snapshot>.json`. Files are replaced atomically (write to
//! a temp file, then rename) and read-modify-write cycles are serialized by an
//! in-process lock, which gives the conditional updates their atomicity for a
//! single process. Sharing a directory between processes is not supported.

use std::path::{Path, PathBuf};
use async_trait::async_trait;
use chrono::NaiveDate;
use depgate_core::{parse_snapshot_date, JobName, RunAttribute, RunKey, RunRecord, Version};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::trait_::{apply_conditional, AuditStore, Result, RunDraft, StorageError};

/// File-based JSON audit store.
pub struct JsonAuditStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl JsonAuditStore {
    /// Create storage rooted at `root`, creating `runs/` if needed.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("runs")).await?;

        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    /// Storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_dir(&self, job_name: &JobName) -> PathBuf {
        self.root.join("runs").join(job_name.as_str())
    }

    fn runs_path(&self, job_name: &JobName, snapshot_date: NaiveDate) -> PathBuf {
        self.job_dir(job_name)
            .join(format!("{}.json", snapshot_date.format("%Y-%m-%d")))
    }

    async fn load(&self, job_name: &JobName, snapshot_date: NaiveDate) -> Result<Vec<RunRecord>> {
        let records: Option<Vec<RunRecord>> = read_json(&self.runs_path(job_name, snapshot_date)).await?;
        Ok(records.unwrap_or_default())
    }

    async fn store(&self, job_name: &JobName, snapshot_date: NaiveDate, records: &[RunRecord]) -> Result<()> {
        fs::create_dir_all(self.job_dir(job_name)).await?;
        write_json_atomic(&self.runs_path(job_name, snapshot_date), &records).await
    }
}

#[async_trait]
impl AuditStore for JsonAuditStore {
    async fn insert_version(
        &self,
        job_name: &JobName,
        snapshot_date: NaiveDate,
        draft: RunDraft,
    ) -> Result<RunRecord> {
        let _guard = self.lock.lock().await;
        let mut records = self.load(job_name, snapshot_date).await?;

        let latest = records.iter().map(|r| r.key.version).max();
        draft.precondition.check(job_name, snapshot_date, latest)?;

        let version = latest.map_or(Version::FIRST, Version::next);
        let record = draft.into_record(RunKey::new(job_name.clone(), snapshot_date, version));
        records.push(record.clone());
        self.store(job_name, snapshot_date, &records).await?;

        debug!(job = %job_name, snapshot = %snapshot_date, version = %version, "inserted run version");
        Ok(record)
    }

    async fn get_records(&self, job_name: &JobName, snapshot_date: NaiveDate) -> Result<Vec<RunRecord>> {
        let mut records = self.load(job_name, snapshot_date).await?;
        records.sort_by_key(|r| r.key.version);
        Ok(records)
    }

    async fn get_record(&self, key: &RunKey) -> Result<RunRecord> {
        self.load(&key.job_name, key.snapshot_date)
            .await?
            .into_iter()
            .find(|r| r.key.version == key.version)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn update_attribute(
        &self,
        key: &RunKey,
        expected_revision: u64,
        attribute: RunAttribute,
    ) -> Result<RunRecord> {
        let _guard = self.lock.lock().await;
        let mut records = self.load(&key.job_name, key.snapshot_date).await?;

        let record = records
            .iter_mut()
            .find(|r| r.key.version == key.version)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        let name = attribute.name();
        apply_conditional(record, expected_revision, attribute)?;
        let updated = record.clone();

        self.store(&key.job_name, key.snapshot_date, &records).await?;
        debug!(run = %key, attribute = name, revision = updated.revision, "updated run attribute");
        Ok(updated)
    }

    async fn list_runs(&self) -> Result<Vec<(JobName, NaiveDate)>> {
        let mut runs = Vec::new();
        let mut jobs = fs::read_dir(self.root.join("runs")).await?;
        while let Some(job_entry) = jobs.next_entry().await? {
            if !job_entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(job_name) = job_entry
                .file_name()
                .to_str()
                .and_then(|name| JobName::new(name).ok())
            else {
                warn!(path = %job_entry.path().display(), "skipping unrecognized job directory");
                continue;
            };

            let mut snapshots = fs::read_dir(job_entry.path()).await?;
            while let Some(entry) = snapshots.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|s| s.to_str()) != Some("json") {
                    continue;
                }
                let parsed = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(parse_snapshot_date);
                match parsed {
                    Some(Ok(date)) => runs.push((job_name.clone(), date)),
                    _ => warn!(path = %path.display(), "skipping unrecognized snapshot file"),
                }
            }
        }
        runs.sort();
        Ok(runs)
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json_atomic<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json.as_bytes()).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trait_::Precondition;
    use depgate_core::{DependencyMap, Fulfillment, RunStatus};

    fn job() -> JobName {
        JobName::new("test_job").unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 25).unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonAuditStore::new(dir.path()).await.unwrap();

        let deps = DependencyMap::pending(["dep1"]).with("dep2", Some(Fulfillment::from("run1")));
        let record = store
            .insert_version(&job(), date(), RunDraft::new(deps.clone(), RunStatus::Waiting))
            .await
            .unwrap();
        assert_eq!(record.key.versioned_key(), "2024-06-25:1");

        // A second handle over the same directory sees the persisted record.
        let reopened = JsonAuditStore::new(dir.path()).await.unwrap();
        let loaded = reopened.get_record(&record.key).await.unwrap();
        assert_eq!(loaded.dependencies, deps);
        assert_eq!(loaded.status, RunStatus::Waiting);
        assert!(dir.path().join("runs/test_job/2024-06-25.json").exists());
    }

    #[tokio::test]
    async fn test_update_attribute_conditional() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonAuditStore::new(dir.path()).await.unwrap();
        let record = store
            .insert_version(&job(), date(), RunDraft::new(DependencyMap::new(), RunStatus::Waiting))
            .await
            .unwrap();

        let updated = store
            .update_attribute(&record.key, record.revision, RunAttribute::Status(RunStatus::Completed))
            .await
            .unwrap();
        assert_eq!(updated.status, RunStatus::Completed);

        let err = store
            .update_attribute(&record.key, record.revision, RunAttribute::Status(RunStatus::Failed))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ConcurrentModification(_)));

        let missing = RunKey::new(job(), date(), Version::new(9).unwrap());
        let err = store
            .update_attribute(&missing, 1, RunAttribute::Status(RunStatus::Failed))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_precondition_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonAuditStore::new(dir.path()).await.unwrap();
        let draft = || RunDraft::new(DependencyMap::new(), RunStatus::Disabled);

        store.insert_version(&job(), date(), draft()).await.unwrap();
        let err = store
            .insert_version(&job(), date(), draft().with_precondition(Precondition::NoneExist))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ConcurrentModification(_)));

        let other = NaiveDate::from_ymd_opt(2024, 6, 26).unwrap();
        store.insert_version(&job(), other, draft()).await.unwrap();
        store.insert_version(&job(), other, draft()).await.unwrap();

        assert_eq!(store.list_runs().await.unwrap(), vec![(job(), date()), (job(), other)]);
        let latest = store.latest_record(&job(), other).await.unwrap().unwrap();
        assert_eq!(latest.key.version.get(), 2);
    }
}
