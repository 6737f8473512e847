//! Inbound events - decoded once at the boundary.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use crate::dependency::DependencyMap;
use crate::id::{parse_snapshot_date, IdError, JobName, RunKey, Version};

/// Why an inbound event was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// A required field is absent
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    /// A field has the wrong JSON type or an unparseable value
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// What was wrong
        reason: String,
    },

    /// An identifier failed validation
    #[error(transparent)]
    Id(#[from] IdError),
}

/// A decoded inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboundEvent {
    /// An upstream dependency became available (possibly partial or duplicate)
    DependencyNotification {
        /// Downstream job
        job_name: JobName,
        /// Snapshot the dependency belongs to
        snapshot_date: NaiveDate,
        /// Partial fulfillment update; empty means the job is disabled
        dependencies: DependencyMap,
    },

    /// Advance a `DEPS_COMPLETE` run by submitting it
    SubmitRequest {
        /// Run to submit
        #[serde(flatten)]
        run: RunKey,
    },

    /// Poll the executor once for a previously submitted step
    PollRequest {
        /// Run being polled
        #[serde(flatten)]
        run: RunKey,
        /// Step returned by the submission
        step_id: String,
    },

    /// Anything else; answered with a no-op
    Unrecognized,
}

impl InboundEvent {
    /// Decode an event by its shape.
    ///
    /// - `step_id` present: poll request
    /// - `action: "submit"`, `directive: "submit"` or
    ///   `job_status: "DEPS_COMPLETE"`: submit request
    /// - `dependencies` present: dependency notification
    /// - otherwise: unrecognized
    ///
    /// An explicit `kind` tag, as produced by serializing an `InboundEvent`,
    /// takes precedence over shape detection.
    pub fn decode(value: &Value) -> Result<Self, DecodeError> {
        let Some(body) = value.as_object() else {
            return Ok(Self::Unrecognized);
        };

        if let Some(kind) = body.get("kind").and_then(Value::as_str) {
            return match kind {
                "dependency_notification" => decode_notification(body),
                "submit_request" => Ok(Self::SubmitRequest { run: decode_run_key(body)? }),
                "poll_request" => decode_poll(body),
                _ => Ok(Self::Unrecognized),
            };
        }

        if body.contains_key("step_id") {
            return decode_poll(body);
        }

        // A `submit` directive fed back as an event also carries `dependencies`.
        let wants_submit = body.get("action").and_then(Value::as_str) == Some("submit")
            || body.get("directive").and_then(Value::as_str) == Some("submit")
            || body.get("job_status").and_then(Value::as_str) == Some("DEPS_COMPLETE");
        if wants_submit {
            return Ok(Self::SubmitRequest { run: decode_run_key(body)? });
        }

        if body.contains_key("dependencies") {
            return decode_notification(body);
        }

        Ok(Self::Unrecognized)
    }

    /// Event kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DependencyNotification { .. } => "dependency_notification",
            Self::SubmitRequest { .. } => "submit_request",
            Self::PollRequest { .. } => "poll_request",
            Self::Unrecognized => "unrecognized",
        }
    }
}

fn decode_notification(body: &Map<String, Value>) -> Result<InboundEvent, DecodeError> {
    let job_name = decode_job_name(body)?;
    let snapshot_date = decode_snapshot_date(body)?;
    let dependencies = match body.get("dependencies") {
        None => return Err(DecodeError::MissingField("dependencies")),
        // Upstream producers sometimes send the map JSON-encoded in a string.
        Some(Value::String(encoded)) => serde_json::from_str(encoded),
        Some(raw @ Value::Object(_)) => serde_json::from_value(raw.clone()),
        Some(Value::Null) => Ok(DependencyMap::new()),
        Some(_) => {
            return Err(DecodeError::InvalidField {
                field: "dependencies",
                reason: "expected an object".to_string(),
            })
        }
    }
    .map_err(|e| DecodeError::InvalidField {
        field: "dependencies",
        reason: e.to_string(),
    })?;

    Ok(InboundEvent::DependencyNotification {
        job_name,
        snapshot_date,
        dependencies,
    })
}

fn decode_poll(body: &Map<String, Value>) -> Result<InboundEvent, DecodeError> {
    let run = decode_run_key(body)?;
    let step_id = match body.get("step_id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(_) => {
            return Err(DecodeError::InvalidField {
                field: "step_id",
                reason: "expected a non-empty string".to_string(),
            })
        }
        None => return Err(DecodeError::MissingField("step_id")),
    };
    Ok(InboundEvent::PollRequest { run, step_id })
}

fn decode_run_key(body: &Map<String, Value>) -> Result<RunKey, DecodeError> {
    let job_name = decode_job_name(body)?;
    let snapshot_date = decode_snapshot_date(body)?;
    // `job_version` is the name upstream state machines use.
    let raw = body
        .get("version")
        .or_else(|| body.get("job_version"))
        .ok_or(DecodeError::MissingField("version"))?;
    let version = match raw {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| IdError::Version(n.to_string()))
            .and_then(Version::new)?,
        Value::String(s) => s.parse()?,
        _ => {
            return Err(DecodeError::InvalidField {
                field: "version",
                reason: "expected an integer".to_string(),
            })
        }
    };
    Ok(RunKey::new(job_name, snapshot_date, version))
}

fn decode_job_name(body: &Map<String, Value>) -> Result<JobName, DecodeError> {
    let raw = required_str(body, "job_name")?;
    Ok(JobName::new(raw)?)
}

fn decode_snapshot_date(body: &Map<String, Value>) -> Result<NaiveDate, DecodeError> {
    let raw = required_str(body, "snapshot_date")?;
    Ok(parse_snapshot_date(raw)?)
}

fn required_str<'a>(body: &'a Map<String, Value>, field: &'static str) -> Result<&'a str, DecodeError> {
    match body.get(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(DecodeError::InvalidField {
            field,
            reason: "expected a string".to_string(),
        }),
        None => Err(DecodeError::MissingField(field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_notification() {
        let event = InboundEvent::decode(&json!({
            "job_name": "jobA",
            "snapshot_date": "20240101",
            "dependencies": {"dep1": null, "dep2": {"runId": "9"}}
        }))
        .unwrap();
        match event {
            InboundEvent::DependencyNotification { job_name, snapshot_date, dependencies } => {
                assert_eq!(job_name.as_str(), "jobA");
                assert_eq!(snapshot_date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
                assert_eq!(dependencies.unfulfilled(), vec!["dep1"]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_decode_string_encoded_dependencies() {
        let event = InboundEvent::decode(&json!({
            "job_name": "jobA",
            "snapshot_date": "2024-01-01",
            "dependencies": "{\"dep1\": \"run123\"}"
        }))
        .unwrap();
        assert_eq!(event.kind(), "dependency_notification");
    }

    #[test]
    fn test_decode_poll_and_submit() {
        let poll = InboundEvent::decode(&json!({
            "job_name": "jobA",
            "snapshot_date": "2024-01-01",
            "job_version": "2",
            "step_id": "s-7"
        }))
        .unwrap();
        assert!(matches!(poll, InboundEvent::PollRequest { ref step_id, .. } if step_id == "s-7"));

        let submit = InboundEvent::decode(&json!({
            "job_name": "jobA",
            "snapshot_date": "2024-01-01",
            "version": 1,
            "job_status": "DEPS_COMPLETE"
        }))
        .unwrap();
        assert_eq!(submit.kind(), "submit_request");

        let fed_back = InboundEvent::decode(&json!({
            "directive": "submit",
            "job_name": "jobA",
            "snapshot_date": "2024-01-01",
            "version": 1,
            "dependencies": {"dep1": "run123"}
        }))
        .unwrap();
        assert_eq!(fed_back.kind(), "submit_request");
    }

    #[test]
    fn test_unrecognized_shape_is_not_an_error() {
        assert_eq!(InboundEvent::decode(&json!({"hello": 1})).unwrap(), InboundEvent::Unrecognized);
        assert_eq!(InboundEvent::decode(&json!([1, 2])).unwrap(), InboundEvent::Unrecognized);
    }

    #[test]
    fn test_malformed_notification() {
        let err = InboundEvent::decode(&json!({"snapshot_date": "2024-01-01", "dependencies": {}}))
            .unwrap_err();
        assert_eq!(err, DecodeError::MissingField("job_name"));

        let err = InboundEvent::decode(&json!({
            "job_name": "../etc",
            "snapshot_date": "2024-01-01",
            "dependencies": {}
        }))
        .unwrap_err();
        assert!(matches!(err, DecodeError::Id(IdError::JobName(_))));

        let err = InboundEvent::decode(&json!({
            "job_name": "jobA",
            "snapshot_date": "2024-01-01",
            "version": 0,
            "step_id": "s"
        }))
        .unwrap_err();
        assert!(matches!(err, DecodeError::Id(IdError::Version(_))));
    }

    #[test]
    fn test_tagged_round_trip() {
        let event = InboundEvent::SubmitRequest {
            run: RunKey::new(
                JobName::new("jobA").unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                Version::FIRST,
            ),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(InboundEvent::decode(&value).unwrap(), event);
    }
}
