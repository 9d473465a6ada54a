use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A repository a node should clone before running a job's prompt.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RepositorySpec {
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub subdirectory: Option<String>,
}

/// A job's position in the PENDING|QUEUED -> RUNNING -> terminal lifecycle.
///
/// Terminal variants are absorbing: once reached, [`JobStatus`] never changes
/// again for that job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = InvalidJobStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "queued" => Self::Queued,
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            other => return Err(InvalidJobStatus(other.to_string())),
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown job status '{0}'")]
pub struct InvalidJobStatus(pub String);

/// A unit of work: a prompt, optionally bound to a node or a set of tags.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub prompt: String,
    pub status: JobStatus,
    pub target_node_id: Option<Uuid>,
    #[serde(default)]
    pub requested_tags: Vec<String>,
    #[serde(default)]
    pub repositories: Vec<RepositorySpec>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub log_path: Option<String>,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Builds a freshly-submitted job. Status follows from whether a target
    /// node was given: a directed job starts QUEUED, everything else PENDING.
    pub fn new_submission(
        prompt: String,
        target_node_id: Option<Uuid>,
        requested_tags: Vec<String>,
        repositories: Vec<RepositorySpec>,
        metadata: HashMap<String, String>,
    ) -> Self {
        let status = if target_node_id.is_some() {
            JobStatus::Queued
        } else {
            JobStatus::Pending
        };
        Self {
            job_id: Uuid::new_v4(),
            prompt,
            status,
            target_node_id,
            requested_tags,
            repositories,
            metadata,
            log_path: None,
            result_summary: None,
            error_message: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Sparse fields accepted by a status update, whether it arrives over the
/// node channel (`job.status`) or the HTTP submission surface.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct JobStatusUpdate {
    pub status: JobStatus,
    pub log_path: Option<String>,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}
