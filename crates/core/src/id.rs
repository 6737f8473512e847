//! Identifiers for tracked runs.

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::OnceLock;

/// Longest accepted job name.
pub const MAX_JOB_NAME_LEN: usize = 128;

/// Errors raised when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// Job name is empty, too long, or contains characters outside `[A-Za-z0-9_.-]`
    #[error("invalid job name: {0:?}")]
    JobName(String),

    /// Snapshot date is neither `YYYY-MM-DD` nor `YYYYMMDD`
    #[error("invalid snapshot date: {0:?}")]
    SnapshotDate(String),

    /// Version is zero or not an integer
    #[error("invalid version: {0:?}")]
    Version(String),

    /// Versioned key is not `<snapshot_date>:<version>`
    #[error("invalid versioned key: {0:?}")]
    VersionedKey(String),
}

fn job_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("static pattern"))
}

/// Name of a recurring job.
///
/// Job names double as storage path segments, so only `[A-Za-z0-9_.-]` is
/// accepted and `.`/`..` are rejected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobName(String);

impl JobName {
    /// Validate and wrap a job name.
    pub fn new(name: impl Into<String>) -> Result<Self, IdError> {
        let name = name.into();
        if name.len() > MAX_JOB_NAME_LEN
            || name == "."
            || name == ".."
            || !job_name_pattern().is_match(&name)
        {
            return Err(IdError::JobName(name));
        }
        Ok(Self(name))
    }

    /// Borrow the name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for JobName {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JobName> for String {
    fn from(name: JobName) -> Self {
        name.0
    }
}

impl std::str::FromStr for JobName {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl std::fmt::Display for JobName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse a snapshot date in `YYYY-MM-DD` or compact `YYYYMMDD` form.
pub fn parse_snapshot_date(s: &str) -> Result<NaiveDate, IdError> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y%m%d"))
        .map_err(|_| IdError::SnapshotDate(s.to_string()))
}

/// Generation number of a run; starts at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Version(NonZeroU32);

impl Version {
    /// The first generation.
    pub const FIRST: Version = Version(NonZeroU32::MIN);

    /// Wrap a raw version number.
    pub fn new(raw: u32) -> Result<Self, IdError> {
        NonZeroU32::new(raw)
            .map(Self)
            .ok_or_else(|| IdError::Version(raw.to_string()))
    }

    /// Raw version number.
    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// The next generation.
    pub fn next(self) -> Version {
        Version(self.0.saturating_add(1))
    }
}

impl TryFrom<u32> for Version {
    type Error = IdError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Version> for u32 {
    fn from(version: Version) -> Self {
        version.get()
    }
}

impl std::str::FromStr for Version {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: u32 = s.trim().parse().map_err(|_| IdError::Version(s.to_string()))?;
        Self::new(raw)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Address of one run generation: `(job_name, snapshot_date, version)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunKey {
    /// Job the run belongs to
    pub job_name: JobName,

    /// Snapshot the run processes
    pub snapshot_date: NaiveDate,

    /// Generation number
    pub version: Version,
}

impl RunKey {
    /// Create a run key.
    pub fn new(job_name: JobName, snapshot_date: NaiveDate, version: Version) -> Self {
        Self {
            job_name,
            snapshot_date,
            version,
        }
    }

    /// Sort key within a job, rendered as `<snapshot_date>:<version>`.
    pub fn versioned_key(&self) -> String {
        format!("{}:{}", self.snapshot_date.format("%Y-%m-%d"), self.version)
    }

    /// Rebuild a run key from a job name and a `<snapshot_date>:<version>` key.
    pub fn from_versioned_key(job_name: JobName, key: &str) -> Result<Self, IdError> {
        let (date, version) = key
            .rsplit_once(':')
            .ok_or_else(|| IdError::VersionedKey(key.to_string()))?;
        let snapshot_date =
            parse_snapshot_date(date).map_err(|_| IdError::VersionedKey(key.to_string()))?;
        let version = version
            .parse()
            .map_err(|_| IdError::VersionedKey(key.to_string()))?;
        Ok(Self::new(job_name, snapshot_date, version))
    }
}

impl std::fmt::Display for RunKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.job_name, self.versioned_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_name_validation() {
        assert!(JobName::new("daily_sales.v2").is_ok());
        assert!(JobName::new("").is_err());
        assert!(JobName::new("..").is_err());
        assert!(JobName::new("a/b").is_err());
        assert!(JobName::new("x".repeat(MAX_JOB_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_snapshot_date_forms() {
        let expected = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        assert_eq!(parse_snapshot_date("2023-01-01").unwrap(), expected);
        assert_eq!(parse_snapshot_date("20230101").unwrap(), expected);
        assert!(parse_snapshot_date("01/01/2023").is_err());
    }

    #[test]
    fn test_version_is_positive() {
        assert!(Version::new(0).is_err());
        assert_eq!(Version::FIRST.get(), 1);
        assert_eq!(Version::FIRST.next().get(), 2);
        assert!(serde_json::from_str::<Version>("0").is_err());
    }

    #[test]
    fn test_versioned_key() {
        let job = JobName::new("jobA").unwrap();
        let key = RunKey::new(
            job.clone(),
            NaiveDate::from_ymd_opt(2024, 6, 25).unwrap(),
            Version::new(3).unwrap(),
        );
        assert_eq!(key.versioned_key(), "2024-06-25:3");
        assert_eq!(RunKey::from_versioned_key(job.clone(), "2024-06-25:3").unwrap(), key);
        assert!(RunKey::from_versioned_key(job, "2024-06-25").is_err());
    }
}
