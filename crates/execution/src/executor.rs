//! Executor adapters - where ready runs are submitted and polled.
//!
//! The engine only talks to executors through [`ExecutorAdapter`]. Two
//! adapters ship with the crate: [`InMemoryExecutor`], a scriptable double
//! used by tests, and [`JournalExecutor`], which keeps one JSON file per step
//! under a directory so an operator (or another tool) can report progress.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use depgate_core::{DependencyMap, RunKey, StepStatus, Time};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};
use ulid::Ulid;

/// Everything the executor needs to start a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Run being submitted
    pub run: RunKey,

    /// Fully fulfilled dependency map
    pub dependencies: DependencyMap,

    /// Executor target from configuration
    pub target: String,
}

/// An accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Opaque step identifier used for polling
    pub step_id: String,

    /// Where the step was placed
    pub binding: String,
}

/// One status observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    /// Observed status
    pub status: StepStatus,

    /// Diagnostic text, typically set on failure
    pub message: Option<String>,
}

impl StepReport {
    /// Report without a message.
    pub fn new(status: StepStatus) -> Self {
        Self { status, message: None }
    }

    /// Attach a message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Executor failures.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// No capacity for the submission right now
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// No step with this identifier is known
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Boundary to the external execution service.
#[async_trait]
pub trait ExecutorAdapter: Send + Sync {
    /// Start a step for a ready run.
    async fn submit(&self, request: &SubmitRequest) -> Result<Submission, ExecutorError>;

    /// Observe the current status of a step.
    async fn poll_status(&self, step_id: &str, binding: &str) -> Result<StepReport, ExecutorError>;
}

fn new_step_id() -> String {
    format!("step-{}", Ulid::new().to_string().to_lowercase())
}

fn capacity_error(target: &str, active: usize, limit: NonZeroUsize) -> ExecutorError {
    ExecutorError::ResourceUnavailable(format!(
        "target {target} has {active} of {limit} step slots in use"
    ))
}

#[derive(Debug, Clone)]
struct ScriptedStep {
    request: SubmitRequest,
    report: StepReport,
}

/// In-process executor whose step statuses are set by the caller.
#[derive(Debug, Default)]
pub struct InMemoryExecutor {
    steps: Mutex<HashMap<String, ScriptedStep>>,
    max_active: Mutex<Option<NonZeroUsize>>,
}

impl InMemoryExecutor {
    /// Unlimited executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse submissions while `limit` steps are unfinished.
    pub fn with_max_active(self, limit: NonZeroUsize) -> Self {
        Self {
            max_active: Mutex::new(Some(limit)),
            ..self
        }
    }

    /// Change the capacity limit; `None` removes it.
    pub async fn set_max_active(&self, limit: Option<NonZeroUsize>) {
        *self.max_active.lock().await = limit;
    }

    /// Script the next observation for a step.
    pub async fn set_report(&self, step_id: &str, report: StepReport) -> Result<(), ExecutorError> {
        let mut steps = self.steps.lock().await;
        let step = steps
            .get_mut(step_id)
            .ok_or_else(|| ExecutorError::UnknownStep(step_id.to_string()))?;
        step.report = report;
        Ok(())
    }

    /// Requests accepted so far, in no particular order.
    pub async fn submissions(&self) -> Vec<SubmitRequest> {
        self.steps.lock().await.values().map(|s| s.request.clone()).collect()
    }
}

#[async_trait]
impl ExecutorAdapter for InMemoryExecutor {
    async fn submit(&self, request: &SubmitRequest) -> Result<Submission, ExecutorError> {
        let mut steps = self.steps.lock().await;
        if let Some(limit) = *self.max_active.lock().await {
            let active = steps.values().filter(|s| !s.report.status.is_terminal()).count();
            if active >= limit.get() {
                return Err(capacity_error(&request.target, active, limit));
            }
        }

        let step_id = new_step_id();
        steps.insert(
            step_id.clone(),
            ScriptedStep {
                request: request.clone(),
                report: StepReport::new(StepStatus::Pending),
            },
        );
        Ok(Submission {
            step_id,
            binding: request.target.clone(),
        })
    }

    async fn poll_status(&self, step_id: &str, _binding: &str) -> Result<StepReport, ExecutorError> {
        self.steps
            .lock()
            .await
            .get(step_id)
            .map(|s| s.report.clone())
            .ok_or_else(|| ExecutorError::UnknownStep(step_id.to_string()))
    }
}

/// Persisted state of one journaled step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEntry {
    /// Step identifier
    pub step_id: String,

    /// Run the step executes
    pub run: RunKey,

    /// Target the step was placed on
    pub target: String,

    /// Dependencies handed to the step
    pub dependencies: DependencyMap,

    /// Last reported status
    pub status: StepStatus,

    /// Last reported message
    #[serde(default)]
    pub message: Option<String>,

    /// When the step was accepted
    pub submitted_at: Time,

    /// Last status change
    pub updated_at: Time,
}

/// File-journal executor.
///
/// Each submission becomes `<root>/steps/<step_id>.json` in `PENDING`; the
/// status is advanced externally with [`JournalExecutor::report`].
pub struct JournalExecutor {
    root: PathBuf,
    max_active: Option<NonZeroUsize>,
    lock: Mutex<()>,
}

impl JournalExecutor {
    /// Journal rooted at `root`, creating `steps/` if needed.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, ExecutorError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("steps")).await?;
        Ok(Self {
            root,
            max_active: None,
            lock: Mutex::new(()),
        })
    }

    /// Refuse submissions while `limit` steps are unfinished.
    pub fn with_max_active(mut self, limit: Option<NonZeroUsize>) -> Self {
        self.max_active = limit;
        self
    }

    fn step_path(&self, step_id: &str) -> PathBuf {
        self.root.join("steps").join(format!("{step_id}.json"))
    }

    /// Load one step entry.
    pub async fn entry(&self, step_id: &str) -> Result<StepEntry, ExecutorError> {
        if step_id.is_empty() || step_id.contains(['/', '\\', '.']) {
            return Err(ExecutorError::UnknownStep(step_id.to_string()));
        }
        match fs::read_to_string(self.step_path(step_id)).await {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ExecutorError::UnknownStep(step_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All journaled steps, oldest first.
    pub async fn entries(&self) -> Result<Vec<StepEntry>, ExecutorError> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(self.root.join("steps")).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let json = fs::read_to_string(&path).await?;
            entries.push(serde_json::from_str::<StepEntry>(&json)?);
        }
        entries.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.step_id.cmp(&b.step_id)));
        Ok(entries)
    }

    /// Record a new status for a step.
    pub async fn report(&self, step_id: &str, report: StepReport) -> Result<StepEntry, ExecutorError> {
        let _guard = self.lock.lock().await;
        let mut entry = self.entry(step_id).await?;
        entry.status = report.status;
        entry.message = report.message;
        entry.updated_at = chrono::Utc::now();
        self.write(&entry).await?;
        info!(step_id, status = %entry.status, "step status reported");
        Ok(entry)
    }

    async fn write(&self, entry: &StepEntry) -> Result<(), ExecutorError> {
        let path = self.step_path(&entry.step_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(entry)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl ExecutorAdapter for JournalExecutor {
    async fn submit(&self, request: &SubmitRequest) -> Result<Submission, ExecutorError> {
        let _guard = self.lock.lock().await;
        if let Some(limit) = self.max_active {
            let active = self
                .entries()
                .await?
                .iter()
                .filter(|e| e.target == request.target && !e.status.is_terminal())
                .count();
            if active >= limit.get() {
                return Err(capacity_error(&request.target, active, limit));
            }
        }

        let now = chrono::Utc::now();
        let entry = StepEntry {
            step_id: new_step_id(),
            run: request.run.clone(),
            target: request.target.clone(),
            dependencies: request.dependencies.clone(),
            status: StepStatus::Pending,
            message: None,
            submitted_at: now,
            updated_at: now,
        };
        self.write(&entry).await?;
        debug!(step_id = %entry.step_id, run = %entry.run, "journaled step");

        Ok(Submission {
            step_id: entry.step_id,
            binding: entry.target,
        })
    }

    async fn poll_status(&self, step_id: &str, _binding: &str) -> Result<StepReport, ExecutorError> {
        let entry = self.entry(step_id).await?;
        Ok(StepReport {
            status: entry.status,
            message: entry.message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use depgate_core::{Fulfillment, JobName, Version};

    fn request(target: &str) -> SubmitRequest {
        SubmitRequest {
            run: RunKey::new(
                JobName::new("jobA").unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                Version::FIRST,
            ),
            dependencies: DependencyMap::new().with("dep1", Some(Fulfillment::from("run1"))),
            target: target.to_string(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_scripted_status() {
        let executor = InMemoryExecutor::new();
        let submission = executor.submit(&request("cluster-a")).await.unwrap();
        assert_eq!(submission.binding, "cluster-a");
        assert!(submission.step_id.starts_with("step-"));

        let first = executor.poll_status(&submission.step_id, "cluster-a").await.unwrap();
        assert_eq!(first.status, StepStatus::Pending);

        executor
            .set_report(&submission.step_id, StepReport::new(StepStatus::Failed).with_message("oom"))
            .await
            .unwrap();
        let report = executor.poll_status(&submission.step_id, "cluster-a").await.unwrap();
        assert_eq!(report.status, StepStatus::Failed);
        assert_eq!(report.message.as_deref(), Some("oom"));

        let err = executor.poll_status("step-missing", "cluster-a").await.unwrap_err();
        assert!(matches!(err, ExecutorError::UnknownStep(_)));
    }

    #[tokio::test]
    async fn test_in_memory_capacity() {
        let executor = InMemoryExecutor::new().with_max_active(NonZeroUsize::new(1).unwrap());
        let first = executor.submit(&request("c")).await.unwrap();
        let err = executor.submit(&request("c")).await.unwrap_err();
        assert!(matches!(err, ExecutorError::ResourceUnavailable(_)));

        executor
            .set_report(&first.step_id, StepReport::new(StepStatus::Completed))
            .await
            .unwrap();
        executor.submit(&request("c")).await.unwrap();
        assert_eq!(executor.submissions().await.len(), 2);
    }

    #[tokio::test]
    async fn test_journal_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let executor = JournalExecutor::new(dir.path()).await.unwrap();
        let submission = executor.submit(&request("cluster-b")).await.unwrap();

        let reopened = JournalExecutor::new(dir.path()).await.unwrap();
        let report = reopened.poll_status(&submission.step_id, "cluster-b").await.unwrap();
        assert_eq!(report.status, StepStatus::Pending);

        reopened
            .report(&submission.step_id, StepReport::new(StepStatus::Running))
            .await
            .unwrap();
        let report = executor.poll_status(&submission.step_id, "cluster-b").await.unwrap();
        assert_eq!(report.status, StepStatus::Running);
        assert_eq!(executor.entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_journal_capacity_per_target() {
        let dir = tempfile::tempdir().unwrap();
        let executor = JournalExecutor::new(dir.path())
            .await
            .unwrap()
            .with_max_active(NonZeroUsize::new(1));
        executor.submit(&request("a")).await.unwrap();
        executor.submit(&request("b")).await.unwrap();
        let err = executor.submit(&request("a")).await.unwrap_err();
        assert!(matches!(err, ExecutorError::ResourceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_journal_rejects_path_like_step_ids() {
        let dir = tempfile::tempdir().unwrap();
        let executor = JournalExecutor::new(dir.path()).await.unwrap();
        let err = executor.poll_status("../escape", "a").await.unwrap_err();
        assert!(matches!(err, ExecutorError::UnknownStep(_)));
    }
}
