//! Raw SQLite row shapes and their conversion to/from the value types in
//! [`crate::model`]. JSON-shaped columns (tags, repositories, metadata) are
//! stored as TEXT and (de)serialized here, mirroring the original
//! storage layer's `_row_to_job`/`_row_to_node` helpers.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{Job, JobStatus, NodeMetadata, NodeStatus, RepositorySpec};

use super::error::StoreError;

#[derive(sqlx::FromRow)]
pub(super) struct JobRow {
    pub job_id: String,
    pub prompt: String,
    pub status: String,
    pub target_node_id: Option<String>,
    pub requested_tags: String,
    pub repositories: String,
    pub metadata: String,
    pub log_path: Option<String>,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub finished_at: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            job_id: Uuid::parse_str(&row.job_id)?,
            prompt: row.prompt,
            status: JobStatus::from_str(&row.status)?,
            target_node_id: row.target_node_id.map(|id| Uuid::parse_str(&id)).transpose()?,
            requested_tags: serde_json::from_str(&row.requested_tags)?,
            repositories: serde_json::from_str::<Vec<RepositorySpec>>(&row.repositories)?,
            metadata: serde_json::from_str(&row.metadata)?,
            log_path: row.log_path,
            result_summary: row.result_summary,
            error_message: row.error_message,
            created_at: DateTime::parse_from_rfc3339(&row.created_at)?.with_timezone(&Utc),
            finished_at: row
                .finished_at
                .map(|ts| DateTime::parse_from_rfc3339(&ts).map(|dt| dt.with_timezone(&Utc)))
                .transpose()?,
        })
    }
}

pub(super) struct JobParams {
    pub job_id: String,
    pub prompt: String,
    pub status: String,
    pub target_node_id: Option<String>,
    pub requested_tags: String,
    pub repositories: String,
    pub metadata: String,
    pub log_path: Option<String>,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub finished_at: Option<String>,
}

impl TryFrom<&Job> for JobParams {
    type Error = StoreError;

    fn try_from(job: &Job) -> Result<Self, Self::Error> {
        Ok(Self {
            job_id: job.job_id.to_string(),
            prompt: job.prompt.clone(),
            status: job.status.as_str().to_string(),
            target_node_id: job.target_node_id.map(|id| id.to_string()),
            requested_tags: serde_json::to_string(&job.requested_tags)?,
            repositories: serde_json::to_string(&job.repositories)?,
            metadata: serde_json::to_string(&job.metadata)?,
            log_path: job.log_path.clone(),
            result_summary: job.result_summary.clone(),
            error_message: job.error_message.clone(),
            created_at: job.created_at.to_rfc3339(),
            finished_at: job.finished_at.map(|ts| ts.to_rfc3339()),
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct NodeRow {
    pub node_id: String,
    pub display_name: Option<String>,
    pub tags: String,
    pub capabilities: String,
    pub status: String,
    pub last_seen: String,
}

impl TryFrom<NodeRow> for NodeMetadata {
    type Error = StoreError;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        Ok(NodeMetadata {
            node_id: Uuid::parse_str(&row.node_id)?,
            display_name: row.display_name,
            tags: serde_json::from_str(&row.tags)?,
            capabilities: serde_json::from_str(&row.capabilities)?,
            status: NodeStatus::from_str(&row.status).map_err(StoreError::Corrupt)?,
            last_seen: DateTime::parse_from_rfc3339(&row.last_seen)?.with_timezone(&Utc),
        })
    }
}

pub(super) struct NodeParams {
    pub node_id: String,
    pub display_name: Option<String>,
    pub tags: String,
    pub capabilities: String,
    pub status: String,
    pub last_seen: String,
}

impl TryFrom<&NodeMetadata> for NodeParams {
    type Error = StoreError;

    fn try_from(node: &NodeMetadata) -> Result<Self, Self::Error> {
        Ok(Self {
            node_id: node.node_id.to_string(),
            display_name: node.display_name.clone(),
            tags: serde_json::to_string(&node.tags)?,
            capabilities: serde_json::to_string(&node.capabilities)?,
            status: node.status.as_str().to_string(),
            last_seen: node.last_seen.to_rfc3339(),
        })
    }
}
