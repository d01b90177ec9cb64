//! Job wire types shared by the tracker, the API client and the pipeline.
//!
//! The backend reports job state as a flat JSON object:
//! `{"job_id", "status", "message", "timestamp", "result"?}`. Both the
//! WebSocket push channel and the `GET /jobs/{job_id}/status` endpoint
//! emit the same shape, so a single [`JobUpdate`] serves both.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::CoreError;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Upload session primary key assigned by the backend.
pub type SessionId = i64;

/// Opaque job identifier issued by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Lifecycle state of a backend job.
///
/// `Completed` and `Failed` are terminal: nothing is expected (or
/// processed) after either one is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    /// Case-insensitive: the backend upper-cases statuses when it updates a
    /// job, but not on every write path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            _ => Err(CoreError::UnknownStatus(s.to_owned())),
        }
    }
}

impl<'de> Deserialize<'de> for JobStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A snapshot of a job's state as reported by the backend.
///
/// `result` is opaque to the client and forwarded verbatim. JSON `null`
/// and an absent field both deserialize to `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    /// Missing on the backend's "Job not found." frame.
    #[serde(default)]
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(default)]
    pub message: String,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: f64,
    /// Backend job kind tag (`"extraction"`, `"indexing"`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl JobUpdate {
    pub fn new(job_id: impl Into<JobId>, status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            message: message.into(),
            timestamp: 0.0,
            service: None,
            result: None,
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The update timestamp as a UTC date, or `None` if it is out of range.
    pub fn timestamp_utc(&self) -> Option<Timestamp> {
        if !self.timestamp.is_finite() {
            return None;
        }
        let millis = (self.timestamp * 1000.0).round();
        if millis.abs() >= i64::MAX as f64 {
            return None;
        }
        chrono::DateTime::from_timestamp_millis(millis as i64)
    }
}

/// Response of every job-starting endpoint (`/orchestrate/analyze`,
/// `/orchestrate/extract`, `/orchestrate/index`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResponse {
    pub job_id: JobId,
    #[serde(default)]
    pub message: String,
}
