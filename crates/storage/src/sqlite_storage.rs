//! SQLite storage backend.
//!
//! One row per run generation. Conditional updates are a single
//! `UPDATE ... WHERE revision = ?`. Version allocation runs inside a
//! `BEGIN IMMEDIATE` transaction, which takes the write lock before the
//! latest version is read, so concurrent writers queue on the busy timeout
//! instead of failing a lock upgrade. A lock still held when the timeout
//! runs out is reported as a concurrent modification.

use async_trait::async_trait;
use chrono::NaiveDate;
use depgate_core::{
    parse_snapshot_date, DependencyMap, JobName, RunAttribute, RunKey, RunRecord, RunStatus, Time, Version,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use super::trait_::{apply_conditional, AuditStore, Result, RunDraft, StorageError};

/// How long a writer waits for the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite audit store.
#[derive(Clone)]
pub struct SqliteAuditStore {
    /// Database connection pool
    pool: sqlx::SqlitePool,
}

impl SqliteAuditStore {
    /// Open (creating if missing) a database file.
    pub async fn new_from_path(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(db_error)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create an in-memory database for testing.
    ///
    /// Every pooled connection would get its own private in-memory database,
    /// so the pool is pinned to a single connection.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(db_error)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_error)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS run_records (
                job_name TEXT NOT NULL,
                snapshot_date TEXT NOT NULL,
                version INTEGER NOT NULL,
                dependencies TEXT NOT NULL,
                job_status TEXT NOT NULL,
                step_id TEXT,
                executor_binding TEXT,
                description TEXT,
                revision INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                submitted_at TEXT,
                PRIMARY KEY (job_name, snapshot_date, version)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    /// Check if the database is healthy.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    async fn fetch(&self, key: &RunKey) -> Result<Option<RunRecord>> {
        let row = sqlx::query(
            "SELECT * FROM run_records WHERE job_name = ? AND snapshot_date = ? AND version = ?",
        )
        .bind(key.job_name.as_str())
        .bind(date_text(key.snapshot_date))
        .bind(i64::from(key.version.get()))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(record_from_row).transpose()
    }
}

/// Read the latest version and insert the next one. The caller holds the
/// write lock.
async fn allocate_version(
    conn: &mut SqliteConnection,
    job_name: &JobName,
    snapshot_date: NaiveDate,
    draft: RunDraft,
) -> Result<RunRecord> {
    let latest: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(version) FROM run_records WHERE job_name = ? AND snapshot_date = ?",
    )
    .bind(job_name.as_str())
    .bind(date_text(snapshot_date))
    .fetch_one(&mut *conn)
    .await
    .map_err(write_error)?;
    let latest = latest.map(version_from_i64).transpose()?;
    draft.precondition.check(job_name, snapshot_date, latest)?;

    let version = latest.map_or(Version::FIRST, Version::next);
    let record = draft.into_record(RunKey::new(job_name.clone(), snapshot_date, version));

    // The primary key rejects a version claimed by a concurrent writer.
    let inserted = sqlx::query(
        "INSERT INTO run_records (job_name, snapshot_date, version, dependencies, job_status,
            step_id, executor_binding, description, revision, created_at, updated_at, submitted_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(job_name.as_str())
    .bind(date_text(snapshot_date))
    .bind(i64::from(version.get()))
    .bind(serde_json::to_string(&record.dependencies)?)
    .bind(record.status.as_str())
    .bind(record.step_id.as_deref())
    .bind(record.executor_binding.as_deref())
    .bind(record.description.as_deref())
    .bind(revision_to_i64(record.revision)?)
    .bind(record.created_at.to_rfc3339())
    .bind(record.updated_at.to_rfc3339())
    .bind(record.submitted_at.map(|t| t.to_rfc3339()))
    .execute(&mut *conn)
    .await;

    match inserted {
        Ok(_) => Ok(record),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(StorageError::ConcurrentModification(
            format!("{job_name}@{snapshot_date}: version {version} claimed concurrently"),
        )),
        Err(e) => Err(write_error(e)),
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn insert_version(
        &self,
        job_name: &JobName,
        snapshot_date: NaiveDate,
        draft: RunDraft,
    ) -> Result<RunRecord> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(write_error)?;

        match allocate_version(&mut *conn, job_name, snapshot_date, draft).await {
            Ok(record) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(write_error)?;
                Ok(record)
            }
            Err(e) => {
                if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    warn!(error = %rollback, "rollback failed, closing connection");
                    // Never hand a connection with an open transaction back to the pool.
                    drop(conn.detach());
                }
                Err(e)
            }
        }
    }

    async fn get_records(&self, job_name: &JobName, snapshot_date: NaiveDate) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM run_records WHERE job_name = ? AND snapshot_date = ? ORDER BY version",
        )
        .bind(job_name.as_str())
        .bind(date_text(snapshot_date))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(record_from_row).collect()
    }

    async fn get_record(&self, key: &RunKey) -> Result<RunRecord> {
        self.fetch(key)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn update_attribute(
        &self,
        key: &RunKey,
        expected_revision: u64,
        attribute: RunAttribute,
    ) -> Result<RunRecord> {
        let mut record = self.get_record(key).await?;
        apply_conditional(&mut record, expected_revision, attribute)?;

        let result = sqlx::query(
            "UPDATE run_records SET dependencies = ?, job_status = ?, step_id = ?, executor_binding = ?,
                description = ?, revision = ?, updated_at = ?, submitted_at = ?
            WHERE job_name = ? AND snapshot_date = ? AND version = ? AND revision = ?",
        )
        .bind(serde_json::to_string(&record.dependencies)?)
        .bind(record.status.as_str())
        .bind(record.step_id.as_deref())
        .bind(record.executor_binding.as_deref())
        .bind(record.description.as_deref())
        .bind(revision_to_i64(record.revision)?)
        .bind(record.updated_at.to_rfc3339())
        .bind(record.submitted_at.map(|t| t.to_rfc3339()))
        .bind(key.job_name.as_str())
        .bind(date_text(key.snapshot_date))
        .bind(i64::from(key.version.get()))
        .bind(revision_to_i64(expected_revision)?)
        .execute(&self.pool)
        .await
        .map_err(write_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::ConcurrentModification(format!(
                "{key}: revision {expected_revision} superseded"
            )));
        }
        Ok(record)
    }

    async fn list_runs(&self) -> Result<Vec<(JobName, NaiveDate)>> {
        let rows = sqlx::query(
            "SELECT DISTINCT job_name, snapshot_date FROM run_records ORDER BY job_name, snapshot_date",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter()
            .map(|row| {
                let job: String = row.try_get("job_name").map_err(db_error)?;
                let date: String = row.try_get("snapshot_date").map_err(db_error)?;
                Ok((parse_job(&job)?, parse_date(&date)?))
            })
            .collect()
    }
}

fn db_error(e: sqlx::Error) -> StorageError {
    StorageError::Unavailable(e.to_string())
}

/// Like `db_error`, but a write that lost the lock to another writer
/// (SQLITE_BUSY or SQLITE_LOCKED, any extended code) is a conflict.
fn write_error(e: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &e {
        let primary = db.code().and_then(|code| code.parse::<i32>().ok()).map(|code| code & 0xff);
        if matches!(primary, Some(5 | 6)) {
            return StorageError::ConcurrentModification(db.message().to_string());
        }
    }
    db_error(e)
}

fn corrupt(what: &str, detail: impl std::fmt::Display) -> StorageError {
    StorageError::Unavailable(format!("corrupt {what} in run_records: {detail}"))
}

fn date_text(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_job(raw: &str) -> Result<JobName> {
    JobName::new(raw).map_err(|e| corrupt("job_name", e))
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    parse_snapshot_date(raw).map_err(|e| corrupt("snapshot_date", e))
}

fn parse_time(raw: &str) -> Result<Time> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| corrupt("timestamp", e))
}

fn version_from_i64(raw: i64) -> Result<Version> {
    u32::try_from(raw)
        .ok()
        .and_then(|v| Version::new(v).ok())
        .ok_or_else(|| corrupt("version", raw))
}

fn revision_to_i64(revision: u64) -> Result<i64> {
    i64::try_from(revision).map_err(|e| corrupt("revision", e))
}

fn record_from_row(row: &SqliteRow) -> Result<RunRecord> {
    let job: String = row.try_get("job_name").map_err(db_error)?;
    let date: String = row.try_get("snapshot_date").map_err(db_error)?;
    let version: i64 = row.try_get("version").map_err(db_error)?;
    let dependencies: String = row.try_get("dependencies").map_err(db_error)?;
    let status: String = row.try_get("job_status").map_err(db_error)?;
    let revision: i64 = row.try_get("revision").map_err(db_error)?;
    let created_at: String = row.try_get("created_at").map_err(db_error)?;
    let updated_at: String = row.try_get("updated_at").map_err(db_error)?;
    let submitted_at: Option<String> = row.try_get("submitted_at").map_err(db_error)?;

    let dependencies: DependencyMap = serde_json::from_str(&dependencies)?;
    let status = RunStatus::from_str(&status).map_err(|e| corrupt("job_status", e))?;

    Ok(RunRecord {
        key: RunKey::new(parse_job(&job)?, parse_date(&date)?, version_from_i64(version)?),
        dependencies,
        status,
        step_id: row.try_get("step_id").map_err(db_error)?,
        executor_binding: row.try_get("executor_binding").map_err(db_error)?,
        description: row.try_get("description").map_err(db_error)?,
        revision: u64::try_from(revision).map_err(|e| corrupt("revision", e))?,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
        submitted_at: submitted_at.as_deref().map(parse_time).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trait_::Precondition;
    use depgate_core::Fulfillment;

    fn job() -> JobName {
        JobName::new("test_job").unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 25).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let store = SqliteAuditStore::in_memory().await.unwrap();
        assert!(store.health_check().await);
    }

    #[tokio::test]
    async fn test_insert_get_and_history() {
        let store = SqliteAuditStore::in_memory().await.unwrap();
        let deps = DependencyMap::pending(["dep1"]);

        let first = store
            .insert_version(
                &job(),
                date(),
                RunDraft::new(deps.clone(), RunStatus::Waiting).with_precondition(Precondition::NoneExist),
            )
            .await
            .unwrap();
        let second = store
            .insert_version(
                &job(),
                date(),
                RunDraft::new(deps, RunStatus::Waiting)
                    .with_precondition(Precondition::LatestIs(first.key.version)),
            )
            .await
            .unwrap();
        assert_eq!(second.key.version.get(), 2);

        let history = store.get_records(&job(), date()).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(store.get_record(&first.key).await.unwrap().status, RunStatus::Waiting);
        assert_eq!(store.list_runs().await.unwrap(), vec![(job(), date())]);
    }

    #[tokio::test]
    async fn test_conditional_update() {
        let store = SqliteAuditStore::in_memory().await.unwrap();
        let record = store
            .insert_version(&job(), date(), RunDraft::new(DependencyMap::pending(["dep1"]), RunStatus::Waiting))
            .await
            .unwrap();

        let filled = DependencyMap::new().with("dep1", Some(Fulfillment::from("run123")));
        let updated = store
            .update_attribute(&record.key, 1, RunAttribute::Dependencies(filled.clone()))
            .await
            .unwrap();
        assert_eq!(updated.revision, 2);
        assert_eq!(store.get_record(&record.key).await.unwrap().dependencies, filled);

        let err = store
            .update_attribute(&record.key, 1, RunAttribute::Status(RunStatus::DepsComplete))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ConcurrentModification(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_first_inserts_conflict_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteAuditStore::new_from_path(&dir.path().join("runs.db")).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    let draft = RunDraft::new(DependencyMap::pending(["dep1"]), RunStatus::Waiting)
                        .with_precondition(Precondition::NoneExist);
                    store.insert_version(&job(), date(), draft).await
                })
            })
            .collect();

        let mut inserted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(record) => {
                    assert_eq!(record.key.version, Version::FIRST);
                    inserted += 1;
                }
                Err(e) => assert!(matches!(e, StorageError::ConcurrentModification(_)), "unexpected error: {e}"),
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(store.get_records(&job(), date()).await.unwrap().len(), 1);

        // The store stays writable after the losers rolled back.
        let latest = store.latest_record(&job(), date()).await.unwrap().unwrap();
        let draft = RunDraft::new(DependencyMap::new(), RunStatus::Disabled)
            .with_precondition(Precondition::LatestIs(latest.key.version));
        assert_eq!(store.insert_version(&job(), date(), draft).await.unwrap().key.version.get(), 2);
    }
}
