//! Directives - the single outbound instruction produced per invocation.

use serde::{Deserialize, Serialize};
use crate::dependency::DependencyMap;
use crate::id::RunKey;
use crate::run::RunStatus;

/// Step status as reported by an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Step is executing
    Running,
    /// Step is queued on the executor
    Pending,
    /// Step finished successfully
    Completed,
    /// Step finished unsuccessfully
    Failed,
}

impl StepStatus {
    /// Whether the step has finished.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Run status this step status maps to.
    pub fn as_run_status(self) -> RunStatus {
        match self {
            Self::Running => RunStatus::Running,
            Self::Pending => RunStatus::Pending,
            Self::Completed => RunStatus::Completed,
            Self::Failed => RunStatus::Failed,
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(Self::Running),
            "PENDING" => Ok(Self::Pending),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_run_status().as_str())
    }
}

/// Instruction for the orchestration layer.
///
/// Serialized with a `"directive"` tag and the run key flattened into the
/// body, e.g. `{"directive":"await_more","job_name":"jobA",...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "directive", rename_all = "snake_case")]
pub enum Directive {
    /// Nothing to do for this event
    NoOp,

    /// Generation is disabled; never runs
    ReportDisabled {
        /// Run addressed
        #[serde(flatten)]
        run: RunKey,
    },

    /// Dependencies are still open; re-invoke on the next notification
    AwaitMore {
        /// Run addressed
        #[serde(flatten)]
        run: RunKey,
    },

    /// Dependencies are complete; submit to the executor
    Submit {
        /// Run addressed
        #[serde(flatten)]
        run: RunKey,
        /// Fulfilled dependencies to hand to the executor
        dependencies: DependencyMap,
    },

    /// Step in flight; poll again later with the same step id
    Poll {
        /// Run addressed
        #[serde(flatten)]
        run: RunKey,
        /// Step to poll
        step_id: String,
        /// Last observed executor status, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        observed: Option<StepStatus>,
    },

    /// Terminal success
    Completed {
        /// Run addressed
        #[serde(flatten)]
        run: RunKey,
    },

    /// Terminal failure
    Failed {
        /// Run addressed
        #[serde(flatten)]
        run: RunKey,
        /// Failure text reported by the executor
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

impl Directive {
    /// The run this directive refers to.
    pub fn run(&self) -> Option<&RunKey> {
        match self {
            Self::NoOp => None,
            Self::ReportDisabled { run }
            | Self::AwaitMore { run }
            | Self::Submit { run, .. }
            | Self::Poll { run, .. }
            | Self::Completed { run }
            | Self::Failed { run, .. } => Some(run),
        }
    }

    /// Whether the directive ends the generation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ReportDisabled { .. } | Self::Completed { .. } | Self::Failed { .. }
        )
    }

    /// Short human-readable summary.
    pub fn summary(&self) -> String {
        match self {
            Self::NoOp => "no-op".to_string(),
            Self::ReportDisabled { run } => format!("Job disabled {}", run.job_name),
            Self::AwaitMore { run } => format!("{run} waiting for dependencies"),
            Self::Submit { run, .. } => format!("{run} ready to submit"),
            Self::Poll { run, step_id, .. } => format!("{run} step {step_id} in flight"),
            Self::Completed { run } => format!("{run} completed"),
            Self::Failed { run, .. } => format!("{run} failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{JobName, Version};
    use chrono::NaiveDate;
    use serde_json::json;

    #[test]
    fn test_directive_wire_shape() {
        let run = RunKey::new(
            JobName::new("jobA").unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            Version::FIRST,
        );
        let directive = Directive::Poll {
            run,
            step_id: "s-1".to_string(),
            observed: Some(StepStatus::Running),
        };
        let value = serde_json::to_value(&directive).unwrap();
        assert_eq!(
            value,
            json!({
                "directive": "poll",
                "job_name": "jobA",
                "snapshot_date": "2024-01-01",
                "version": 1,
                "step_id": "s-1",
                "observed": "RUNNING"
            })
        );
        assert!(!directive.is_terminal());
    }

    #[test]
    fn test_disabled_summary() {
        let run = RunKey::new(
            JobName::new("job1").unwrap(),
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            Version::FIRST,
        );
        let directive = Directive::ReportDisabled { run };
        assert_eq!(directive.summary(), "Job disabled job1");
        assert!(directive.is_terminal());
        assert!(Directive::NoOp.run().is_none());
    }
}
