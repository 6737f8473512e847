//! Status poller - one executor observation per invocation.

use std::sync::Arc;
use depgate_core::{Directive, RunAttribute, RunKey, RunRecord, RunStatus, StepStatus};
use depgate_storage::AuditStore;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::executor::{ExecutorAdapter, StepReport};
use crate::lifecycle::advance_record;
use crate::retry::retry_on_conflict;

/// Polls the executor for submitted runs and records terminal outcomes.
pub struct StatusPoller {
    store: Arc<dyn AuditStore>,
    executor: Arc<dyn ExecutorAdapter>,
    config: EngineConfig,
}

impl StatusPoller {
    /// Create a poller.
    pub fn new(store: Arc<dyn AuditStore>, executor: Arc<dyn ExecutorAdapter>, config: EngineConfig) -> Self {
        Self { store, executor, config }
    }

    /// Observe `step_id` once and translate the result into a directive.
    ///
    /// Runs already recorded as terminal are answered from the store without
    /// contacting the executor.
    pub async fn poll(&self, key: &RunKey, step_id: &str) -> Result<Directive> {
        let record = self.store.get_record(key).await?;
        if record.step_id.as_deref() != Some(step_id) {
            return Err(EngineError::StepMismatch {
                run: key.clone(),
                requested: step_id.to_string(),
                recorded: record.step_id,
            });
        }
        if matches!(record.status, RunStatus::Completed | RunStatus::Failed) {
            debug!(run = %key, status = %record.status, "run already finished");
            return advance_record(&record);
        }

        let binding = record.executor_binding.as_deref().unwrap_or_default();
        let report = self
            .executor
            .poll_status(step_id, binding)
            .await
            .map_err(|e| EngineError::Executor(e.to_string()))?;

        match report.status {
            StepStatus::Completed | StepStatus::Failed => {
                let record = self.record_outcome(key, &report).await?;
                info!(run = %key, %step_id, status = %record.status, "step finished");
                advance_record(&record)
            }
            StepStatus::Running | StepStatus::Pending => {
                if self.config.persist_transient_status {
                    self.record_transient(key, report.status).await?;
                }
                debug!(run = %key, %step_id, status = %report.status, "step in flight");
                Ok(Directive::Poll {
                    run: key.clone(),
                    step_id: step_id.to_string(),
                    observed: Some(report.status),
                })
            }
        }
    }

    async fn record_outcome(&self, key: &RunKey, report: &StepReport) -> Result<RunRecord> {
        let status = report.status.as_run_status();
        retry_on_conflict(&self.config.retry, "record outcome", || async move {
            let record = self.store.get_record(key).await?;
            if record.status == status {
                return Ok(record);
            }
            if record.status.is_terminal() {
                warn!(run = %key, recorded = %record.status, observed = %status, "ignoring conflicting outcome");
                return Ok(record);
            }
            let attribute = RunAttribute::Outcome {
                status,
                description: report.message.clone(),
            };
            Ok(self.store.update_attribute(key, record.revision, attribute).await?)
        })
        .await
    }

    async fn record_transient(&self, key: &RunKey, observed: StepStatus) -> Result<()> {
        let status = observed.as_run_status();
        retry_on_conflict(&self.config.retry, "record step status", || async move {
            let record = self.store.get_record(key).await?;
            if record.status == status || record.status.is_terminal() {
                return Ok(());
            }
            self.store
                .update_attribute(key, record.revision, RunAttribute::Status(status))
                .await?;
            Ok(())
        })
        .await
    }
}
