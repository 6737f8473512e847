//! Run record model - one persisted generation of a (job, snapshot) run.

use serde::{Deserialize, Serialize};
use crate::dependency::DependencyMap;
use crate::id::RunKey;
use crate::Time;

/// Lifecycle status of a run generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Created from an empty dependency set; never runs
    Disabled,
    /// Gathering dependency notifications
    Waiting,
    /// Every dependency fulfilled, ready to submit
    DepsComplete,
    /// Executor reports the step running
    Running,
    /// Executor accepted the step but has not started it
    Pending,
    /// Executor finished the step successfully
    Completed,
    /// Executor finished the step unsuccessfully
    Failed,
}

impl RunStatus {
    /// No further transition is possible for the generation.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Disabled)
    }

    /// Upper-case wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "DISABLED",
            Self::Waiting => "WAITING",
            Self::DepsComplete => "DEPS_COMPLETE",
            Self::Running => "RUNNING",
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DISABLED" => Ok(Self::Disabled),
            "WAITING" => Ok(Self::Waiting),
            "DEPS_COMPLETE" => Ok(Self::DepsComplete),
            "RUNNING" => Ok(Self::Running),
            "PENDING" => Ok(Self::Pending),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// The persisted unit: one version of a (job, snapshot) run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Address of this generation
    pub key: RunKey,

    /// Dependencies and their fulfillment
    pub dependencies: DependencyMap,

    /// Current lifecycle status
    pub status: RunStatus,

    /// Executor step handling this generation
    #[serde(default)]
    pub step_id: Option<String>,

    /// Where the step runs (e.g. cluster identifier)
    #[serde(default)]
    pub executor_binding: Option<String>,

    /// Failure or diagnostic text
    #[serde(default)]
    pub description: Option<String>,

    /// Bumped on every update; the compare-and-set token
    pub revision: u64,

    /// When the generation was created
    pub created_at: Time,

    /// Last update
    pub updated_at: Time,

    /// When the executor accepted the step
    #[serde(default)]
    pub submitted_at: Option<Time>,
}

impl RunRecord {
    /// Fresh record at revision 1.
    pub fn new(key: RunKey, dependencies: DependencyMap, status: RunStatus) -> Self {
        let now = chrono::Utc::now();
        Self {
            key,
            dependencies,
            status,
            step_id: None,
            executor_binding: None,
            description: None,
            revision: 1,
            created_at: now,
            updated_at: now,
            submitted_at: None,
        }
    }

    /// Whether an executor step has been recorded.
    pub fn is_submitted(&self) -> bool {
        self.step_id.is_some()
    }

    /// Apply one attribute update, bumping the revision.
    ///
    /// Callers are expected to have checked the revision precondition.
    pub fn apply(&mut self, attribute: RunAttribute) {
        match attribute {
            RunAttribute::Dependencies(dependencies) => self.dependencies = dependencies,
            RunAttribute::Status(status) => self.status = status,
            RunAttribute::Submission { step_id, executor_binding, submitted_at } => {
                self.step_id = Some(step_id);
                self.executor_binding = Some(executor_binding);
                self.submitted_at = Some(submitted_at);
                self.description = None;
            }
            RunAttribute::Description(description) => self.description = description,
            RunAttribute::Outcome { status, description } => {
                self.status = status;
                if description.is_some() {
                    self.description = description;
                }
            }
        }
        self.revision += 1;
        self.updated_at = chrono::Utc::now();
    }
}

/// A single attribute update on a run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "attribute", content = "value", rename_all = "snake_case")]
pub enum RunAttribute {
    /// Replace the dependency map
    Dependencies(DependencyMap),

    /// Set the lifecycle status
    Status(RunStatus),

    /// Record an accepted submission; clears any stale description
    Submission {
        /// Executor step identifier
        step_id: String,
        /// Executor binding
        executor_binding: String,
        /// Acceptance time
        submitted_at: Time,
    },

    /// Set or clear the diagnostic text
    Description(Option<String>),

    /// Set a status together with an optional diagnostic
    Outcome {
        /// New status
        status: RunStatus,
        /// Diagnostic text; `None` leaves the current one
        description: Option<String>,
    },
}

impl RunAttribute {
    /// Attribute name as stored.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dependencies(_) => "dependencies",
            Self::Status(_) => "job_status",
            Self::Submission { .. } => "submission",
            Self::Description(_) => "description",
            Self::Outcome { .. } => "outcome",
        }
    }
}
