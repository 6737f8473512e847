//! Event dispatcher - the single entry point per invocation.

use std::sync::Arc;
use depgate_core::{Directive, InboundEvent};
use depgate_storage::AuditStore;
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::executor::ExecutorAdapter;
use crate::lifecycle::LifecycleController;
use crate::merge::MergeEngine;
use crate::poller::StatusPoller;

/// Routes one inbound event to the merge engine, controller or poller and
/// returns exactly one directive.
pub struct Dispatcher {
    merge: MergeEngine,
    lifecycle: LifecycleController,
    poller: StatusPoller,
}

impl Dispatcher {
    /// Wire the components over a shared store and executor.
    pub fn new(store: Arc<dyn AuditStore>, executor: Arc<dyn ExecutorAdapter>, config: EngineConfig) -> Self {
        Self {
            merge: MergeEngine::new(store.clone(), config.retry),
            lifecycle: LifecycleController::new(store.clone(), executor.clone(), config.clone()),
            poller: StatusPoller::new(store, executor, config),
        }
    }

    /// Merge engine.
    pub fn merge(&self) -> &MergeEngine {
        &self.merge
    }

    /// Lifecycle controller.
    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    /// Status poller.
    pub fn poller(&self) -> &StatusPoller {
        &self.poller
    }

    /// Decode a raw event and dispatch it.
    ///
    /// Decoding failures are returned as `MalformedInput` before any record
    /// is read or written.
    pub async fn dispatch_value(&self, value: &serde_json::Value) -> Result<Directive> {
        let event = InboundEvent::decode(value)?;
        self.dispatch(event).await
    }

    /// Dispatch a decoded event.
    pub async fn dispatch(&self, event: InboundEvent) -> Result<Directive> {
        let kind = event.kind();
        debug!(kind, "dispatching event");

        let result = match event {
            InboundEvent::DependencyNotification { job_name, snapshot_date, dependencies } => {
                let outcome = self.merge.merge_dependency(&job_name, snapshot_date, &dependencies).await?;
                debug!(run = %outcome.record.key, action = ?outcome.action, status = %outcome.status(), "merged");
                self.lifecycle.advance(&job_name, snapshot_date).await
            }
            InboundEvent::SubmitRequest { run } => self.lifecycle.submit(&run).await,
            InboundEvent::PollRequest { run, step_id } => self.poller.poll(&run, &step_id).await,
            InboundEvent::Unrecognized => {
                info!("ignoring unrecognized event");
                Ok(Directive::NoOp)
            }
        };

        match &result {
            Ok(directive) => info!(kind, "{}", directive.summary()),
            Err(e) if e.is_retryable() => info!(kind, error = %e, "retryable failure"),
            Err(e) => error!(kind, error = %e, "dispatch failed"),
        }
        result
    }
}
