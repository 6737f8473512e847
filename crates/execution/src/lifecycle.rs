//! Run lifecycle controller - maps record state to the next directive and
//! performs submission.

use std::sync::Arc;
use chrono::NaiveDate;
use depgate_core::{Directive, JobName, RunAttribute, RunKey, RunRecord, RunStatus, StepStatus};
use depgate_storage::AuditStore;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::executor::{ExecutorAdapter, ExecutorError, SubmitRequest, Submission};
use crate::retry::retry_on_conflict;

/// Decides what happens next for a run generation.
pub struct LifecycleController {
    store: Arc<dyn AuditStore>,
    executor: Arc<dyn ExecutorAdapter>,
    config: EngineConfig,
}

impl LifecycleController {
    /// Create a controller.
    pub fn new(store: Arc<dyn AuditStore>, executor: Arc<dyn ExecutorAdapter>, config: EngineConfig) -> Self {
        Self { store, executor, config }
    }

    /// Directive for the latest generation of (job, snapshot).
    pub async fn advance(&self, job_name: &JobName, snapshot_date: NaiveDate) -> Result<Directive> {
        let record = self
            .store
            .latest_record(job_name, snapshot_date)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("{job_name}@{snapshot_date}")))?;
        advance_record(&record)
    }

    /// Submit a `DEPS_COMPLETE` run to the executor.
    ///
    /// A run that already carries a step id is not submitted again; the
    /// existing step is returned for polling.
    pub async fn submit(&self, key: &RunKey) -> Result<Directive> {
        let record = self.store.get_record(key).await?;
        if let Some(step_id) = record.step_id.clone() {
            info!(run = %key, %step_id, "run already submitted");
            return advance_record(&record);
        }
        if record.status != RunStatus::DepsComplete || !record.dependencies.is_complete() {
            return Err(EngineError::InvalidState {
                run: key.clone(),
                status: record.status,
                operation: "submit",
            });
        }

        let request = SubmitRequest {
            run: key.clone(),
            dependencies: record.dependencies.clone(),
            target: self.config.executor_target.clone(),
        };
        match self.executor.submit(&request).await {
            Ok(submission) => {
                let record = match self.record_submission(key, &submission).await {
                    Ok(record) => record,
                    Err(e) => {
                        // The step is running but the record does not know it.
                        warn!(
                            run = %key,
                            step_id = %submission.step_id,
                            binding = %submission.binding,
                            error = %e,
                            "step accepted but not recorded; reconcile before resubmitting"
                        );
                        return Err(e);
                    }
                };
                info!(
                    run = %key,
                    step_id = ?record.step_id,
                    binding = ?record.executor_binding,
                    "submitted run"
                );
                advance_record(&record)
            }
            Err(ExecutorError::ResourceUnavailable(reason)) => {
                warn!(run = %key, %reason, "executor has no capacity");
                self.record_description(key, &reason).await?;
                Err(EngineError::ResourceUnavailable { run: key.clone(), reason })
            }
            Err(other) => Err(EngineError::Executor(other.to_string())),
        }
    }

    async fn record_submission(&self, key: &RunKey, submission: &Submission) -> Result<RunRecord> {
        retry_on_conflict(&self.config.retry, "record submission", || async move {
            let record = self.store.get_record(key).await?;
            if let Some(existing) = &record.step_id {
                if existing != &submission.step_id {
                    warn!(run = %key, %existing, duplicate = %submission.step_id, "run was submitted concurrently");
                }
                return Ok(record);
            }
            let attribute = RunAttribute::Submission {
                step_id: submission.step_id.clone(),
                executor_binding: submission.binding.clone(),
                submitted_at: chrono::Utc::now(),
            };
            Ok(self.store.update_attribute(key, record.revision, attribute).await?)
        })
        .await
    }

    async fn record_description(&self, key: &RunKey, reason: &str) -> Result<RunRecord> {
        retry_on_conflict(&self.config.retry, "record description", || async move {
            let record = self.store.get_record(key).await?;
            if record.description.as_deref() == Some(reason) {
                return Ok(record);
            }
            let attribute = RunAttribute::Description(Some(reason.to_string()));
            Ok(self.store.update_attribute(key, record.revision, attribute).await?)
        })
        .await
    }
}

/// Directive implied by a record's current state.
pub fn advance_record(record: &RunRecord) -> Result<Directive> {
    let run = record.key.clone();
    let directive = match record.status {
        RunStatus::Disabled => Directive::ReportDisabled { run },
        RunStatus::Waiting => Directive::AwaitMore { run },
        RunStatus::DepsComplete if !record.dependencies.is_complete() => {
            warn!(run = %run, open = ?record.dependencies.unfulfilled(), "DEPS_COMPLETE run has open dependencies");
            Directive::AwaitMore { run }
        }
        RunStatus::DepsComplete => match &record.step_id {
            Some(step_id) => Directive::Poll {
                run,
                step_id: step_id.clone(),
                observed: None,
            },
            None => Directive::Submit {
                run,
                dependencies: record.dependencies.clone(),
            },
        },
        RunStatus::Running | RunStatus::Pending => {
            let Some(step_id) = record.step_id.clone() else {
                return Err(EngineError::InvalidState {
                    run,
                    status: record.status,
                    operation: "poll without a step id",
                });
            };
            let observed = if record.status == RunStatus::Running {
                StepStatus::Running
            } else {
                StepStatus::Pending
            };
            Directive::Poll {
                run,
                step_id,
                observed: Some(observed),
            }
        }
        RunStatus::Completed => Directive::Completed { run },
        RunStatus::Failed => Directive::Failed {
            run,
            description: record.description.clone(),
        },
    };
    Ok(directive)
}
