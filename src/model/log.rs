use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ();

    /// Unrecognised levels fall back to `info` — job logs are free-form
    /// operator-facing text, not something worth rejecting a frame over.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "warning" | "warn" => Self::Warning,
            "error" => Self::Error,
            _ => Self::Info,
        })
    }
}

/// A single append-only log line for a job, at a dense per-job sequence
/// number (§3: "sequence numbers per job are dense... and strictly
/// monotonic").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub job_id: Uuid,
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}
