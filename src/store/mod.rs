//! Durable persistence (C1): a single-writer embedded SQLite store exposing
//! typed, transactional operations over jobs, nodes, job logs, and
//! third-party tokens.

mod error;
mod migrations;
mod rows;

use std::path::Path;

use chrono::Utc;
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use uuid::Uuid;

pub use error::StoreError;

use crate::model::{Job, JobLogEntry, JobStatus, JobStatusUpdate, LogLevel, NodeMetadata, UserToken};
use rows::{JobParams, JobRow, NodeParams, NodeRow};

/// Sentinel written to `result_summary` the moment a job is acquired by
/// [`Store::assign_job`] — matches the behaviour of the original
/// implementation's dispatcher and gives operators a visible marker that a
/// job was handed off even before any `job.status` update arrives.
const DISPATCHED_SENTINEL: &str = "dispatched";

pub struct Store {
    pool: SqlitePool,
    // Per-job sequence-number cache for `append_job_log`. A cache miss falls
    // back to `MAX(seq)`, so concurrent appenders across process restarts or
    // cache evictions still produce dense, contiguous sequences (§4.1).
    log_seq_cache: DashMap<Uuid, i64>,
}

impl Store {
    /// Opens (creating if absent) the SQLite database at `path` and applies
    /// any pending migrations. The pool is capped at a single connection:
    /// the spec's "single-writer model" non-goal is enforced at the type
    /// level rather than left to discipline.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(sqlx::Error::Io)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        migrations::run(&pool).await?;

        Ok(Self {
            pool,
            log_seq_cache: DashMap::new(),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -- Jobs ----------------------------------------------------------

    pub async fn upsert_job(&self, job: &Job) -> Result<(), StoreError> {
        let p = JobParams::try_from(job)?;
        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, prompt, status, target_node_id, requested_tags,
                repositories, metadata, log_path, result_summary,
                error_message, created_at, finished_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                prompt = excluded.prompt,
                status = excluded.status,
                target_node_id = excluded.target_node_id,
                requested_tags = excluded.requested_tags,
                repositories = excluded.repositories,
                metadata = excluded.metadata,
                log_path = excluded.log_path,
                result_summary = excluded.result_summary,
                error_message = excluded.error_message,
                created_at = excluded.created_at,
                finished_at = excluded.finished_at
            "#,
        )
        .bind(p.job_id)
        .bind(p.prompt)
        .bind(p.status)
        .bind(p.target_node_id)
        .bind(p.requested_tags)
        .bind(p.repositories)
        .bind(p.metadata)
        .bind(p.log_path)
        .bind(p.result_summary)
        .bind(p.error_message)
        .bind(p.created_at)
        .bind(p.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    /// Most-recent first by creation time, optionally filtered by status.
    pub async fn list_jobs(&self, limit: i64, status: Option<JobStatus>) -> Result<Vec<Job>, StoreError> {
        let rows: Vec<JobRow> = match status {
            Some(status) => {
                sqlx::query_as("SELECT * FROM jobs WHERE status = ? ORDER BY created_at DESC LIMIT ?")
                    .bind(status.as_str())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            },
            None => {
                sqlx::query_as("SELECT * FROM jobs ORDER BY created_at DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            },
        };
        rows.into_iter().map(Job::try_from).collect()
    }

    /// Oldest first — the dispatcher relies on this ordering *being* the
    /// scheduling order (§4.1).
    pub async fn list_jobs_by_status(&self, statuses: &[JobStatus], limit: i64) -> Result<Vec<Job>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = statuses.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT * FROM jobs WHERE status IN ({placeholders}) ORDER BY created_at ASC LIMIT ?"
        );
        let mut query = sqlx::query_as(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows: Vec<JobRow> = query.bind(limit).fetch_all(&self.pool).await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    /// Sparse update. Unset fields are preserved; terminal statuses stamp
    /// `finished_at`. Attempting to leave a terminal status is ignored with
    /// a logged warning rather than rejected (§9 open-question resolution).
    pub async fn update_job_status(&self, job_id: Uuid, update: &JobStatusUpdate) -> Result<(), StoreError> {
        let Some(current) = self.get_job(job_id).await? else {
            tracing::warn!(%job_id, "update_job_status for unknown job");
            return Ok(());
        };

        if current.status.is_terminal() {
            tracing::warn!(
                %job_id,
                from = current.status.as_str(),
                to = update.status.as_str(),
                "ignoring status update out of a terminal state"
            );
            return Ok(());
        }

        let finished_at = if update.status.is_terminal() {
            Some(Utc::now().to_rfc3339())
        } else {
            current.finished_at.map(|ts| ts.to_rfc3339())
        };

        sqlx::query(
            r#"
            UPDATE jobs SET
                status = ?,
                log_path = COALESCE(?, log_path),
                result_summary = COALESCE(?, result_summary),
                error_message = COALESCE(?, error_message),
                finished_at = ?
            WHERE job_id = ?
            "#,
        )
        .bind(update.status.as_str())
        .bind(&update.log_path)
        .bind(&update.result_summary)
        .bind(&update.error_message)
        .bind(finished_at)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Conditionally transitions {PENDING, QUEUED} -> RUNNING, binding the
    /// job to `node_id`. Returns `true` iff a row changed. This is the
    /// concurrency-safe acquire primitive the dispatcher depends on: two
    /// concurrent callers racing on the same job id will see exactly one
    /// `true`.
    pub async fn assign_job(&self, job_id: Uuid, node_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = ?, target_node_id = ?, result_summary = ?
            WHERE job_id = ? AND status IN (?, ?)
            "#,
        )
        .bind(JobStatus::Running.as_str())
        .bind(node_id.to_string())
        .bind(DISPATCHED_SENTINEL)
        .bind(job_id.to_string())
        .bind(JobStatus::Pending.as_str())
        .bind(JobStatus::Queued.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Startup sweep: jobs still RUNNING from a previous process lifetime
    /// are forced to FAILED. Gated by a flag at the call site (§4.1,
    /// resolving the §9 open question on restart behaviour); never called
    /// automatically by anything in this module.
    pub async fn fail_stale_running(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = ?, error_message = ?, finished_at = ?
            WHERE status = ?
            "#,
        )
        .bind(JobStatus::Failed.as_str())
        .bind("master restarted while job was running")
        .bind(Utc::now().to_rfc3339())
        .bind(JobStatus::Running.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // -- Job logs --------------------------------------------------------

    /// Appends a log line with the next dense sequence number for `job_id`.
    /// The cache is consulted first; on a miss, `MAX(seq)` is read so
    /// concurrent appenders (or a process restart) never collide or skip.
    pub async fn append_job_log(&self, job_id: Uuid, level: LogLevel, message: &str) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let next_seq = match self.log_seq_cache.get(&job_id) {
            Some(seq) => *seq + 1,
            None => {
                let row: (Option<i64>,) =
                    sqlx::query_as("SELECT MAX(seq) FROM job_logs WHERE job_id = ?")
                        .bind(job_id.to_string())
                        .fetch_one(&mut *tx)
                        .await?;
                row.0.unwrap_or(0) + 1
            },
        };

        sqlx::query(
            "INSERT INTO job_logs (job_id, seq, timestamp, level, message) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(job_id.to_string())
        .bind(next_seq)
        .bind(Utc::now().to_rfc3339())
        .bind(level.as_str())
        .bind(message)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.log_seq_cache.insert(job_id, next_seq);
        Ok(next_seq)
    }

    /// Ordered ascending by sequence; `after_seq` enables incremental
    /// tailing without missing or duplicating entries (§8 round-trip
    /// property).
    pub async fn list_job_logs(
        &self,
        job_id: Uuid,
        limit: i64,
        after_seq: Option<i64>,
    ) -> Result<Vec<JobLogEntry>, StoreError> {
        #[derive(sqlx::FromRow)]
        struct Row {
            job_id: String,
            seq: i64,
            timestamp: String,
            level: String,
            message: String,
        }

        let rows: Vec<Row> = match after_seq {
            Some(after) => {
                sqlx::query_as(
                    "SELECT * FROM job_logs WHERE job_id = ? AND seq > ? ORDER BY seq ASC LIMIT ?",
                )
                .bind(job_id.to_string())
                .bind(after)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            },
            None => {
                sqlx::query_as("SELECT * FROM job_logs WHERE job_id = ? ORDER BY seq ASC LIMIT ?")
                    .bind(job_id.to_string())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            },
        };

        rows.into_iter()
            .map(|r| {
                Ok(JobLogEntry {
                    job_id: Uuid::parse_str(&r.job_id)?,
                    seq: r.seq,
                    timestamp: chrono::DateTime::parse_from_rfc3339(&r.timestamp)?.with_timezone(&Utc),
                    level: r.level.parse().unwrap_or(LogLevel::Info),
                    message: r.message,
                })
            })
            .collect()
    }

    // -- Nodes -------------------------------------------------------------

    pub async fn upsert_node(&self, node: &NodeMetadata) -> Result<(), StoreError> {
        let p = NodeParams::try_from(node)?;
        sqlx::query(
            r#"
            INSERT INTO nodes (node_id, display_name, tags, capabilities, status, last_seen)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(node_id) DO UPDATE SET
                display_name = excluded.display_name,
                tags = excluded.tags,
                capabilities = excluded.capabilities,
                status = excluded.status,
                last_seen = excluded.last_seen
            "#,
        )
        .bind(p.node_id)
        .bind(p.display_name)
        .bind(p.tags)
        .bind(p.capabilities)
        .bind(p.status)
        .bind(p.last_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeMetadata>, StoreError> {
        let rows: Vec<NodeRow> = sqlx::query_as("SELECT * FROM nodes ORDER BY last_seen DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(NodeMetadata::try_from).collect()
    }

    // -- User tokens (opaque to the core scheduler) -------------------------

    pub async fn set_user_token(&self, token: &UserToken) -> Result<(), StoreError> {
        let metadata = serde_json::to_string(&token.metadata)?;
        sqlx::query(
            r#"
            INSERT INTO user_tokens (user_id, provider, access_token, refresh_token, expires_at, metadata)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, provider) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                metadata = excluded.metadata
            "#,
        )
        .bind(&token.user_id)
        .bind(&token.provider)
        .bind(&token.access_token)
        .bind(&token.refresh_token)
        .bind(token.expires_at.map(|ts| ts.to_rfc3339()))
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_user_token(&self, user_id: &str, provider: &str) -> Result<Option<UserToken>, StoreError> {
        #[derive(sqlx::FromRow)]
        struct Row {
            user_id: String,
            provider: String,
            access_token: String,
            refresh_token: Option<String>,
            expires_at: Option<String>,
            metadata: String,
        }

        let row: Option<Row> = sqlx::query_as("SELECT * FROM user_tokens WHERE user_id = ? AND provider = ?")
            .bind(user_id)
            .bind(provider)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| {
            Ok(UserToken {
                user_id: r.user_id,
                provider: r.provider,
                access_token: r.access_token,
                refresh_token: r.refresh_token,
                expires_at: r
                    .expires_at
                    .map(|ts| chrono::DateTime::parse_from_rfc3339(&ts).map(|dt| dt.with_timezone(&Utc)))
                    .transpose()?,
                metadata: serde_json::from_str(&r.metadata)?,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RepositorySpec;
    use std::collections::HashMap;

    async fn open_temp() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("jobmesh.sqlite3")).await.unwrap();
        (store, dir)
    }

    fn sample_job() -> Job {
        Job::new_submission(
            "say hello".to_string(),
            None,
            vec!["gpu".to_string()],
            vec![RepositorySpec {
                url: "https://example.com/repo.git".to_string(),
                branch: Some("main".to_string()),
                subdirectory: None,
            }],
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn round_trips_a_submitted_job() {
        let (store, _dir) = open_temp().await;
        let job = sample_job();
        store.upsert_job(&job).await.unwrap();

        let fetched = store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(fetched.job_id, job.job_id);
        assert_eq!(fetched.status, JobStatus::Pending);
        assert_eq!(fetched.requested_tags, vec!["gpu".to_string()]);

        let listed = store.list_jobs_by_status(&[JobStatus::Pending], 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].job_id, job.job_id);
    }

    #[tokio::test]
    async fn assign_job_is_a_single_winner_acquire() {
        let (store, _dir) = open_temp().await;
        let job = sample_job();
        store.upsert_job(&job).await.unwrap();

        let node_a = Uuid::new_v4();
        let node_b = Uuid::new_v4();

        let (won_a, won_b) = tokio::join!(
            store.assign_job(job.job_id, node_a),
            store.assign_job(job.job_id, node_b),
        );
        let (won_a, won_b) = (won_a.unwrap(), won_b.unwrap());

        assert_ne!(won_a, won_b, "exactly one caller should win the race");

        let final_job = store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(final_job.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn terminal_status_is_absorbing() {
        let (store, _dir) = open_temp().await;
        let mut job = sample_job();
        job.status = JobStatus::Succeeded;
        job.finished_at = Some(Utc::now());
        store.upsert_job(&job).await.unwrap();

        store
            .update_job_status(
                job.job_id,
                &JobStatusUpdate {
                    status: JobStatus::Running,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let fetched = store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Succeeded, "terminal status must not regress");
    }

    #[tokio::test]
    async fn log_sequence_numbers_are_dense_and_ordered() {
        let (store, _dir) = open_temp().await;
        let job_id = Uuid::new_v4();

        for i in 0..5 {
            let seq = store
                .append_job_log(job_id, LogLevel::Info, &format!("line {i}"))
                .await
                .unwrap();
            assert_eq!(seq, i + 1);
        }

        let all = store.list_job_logs(job_id, 100, None).await.unwrap();
        assert_eq!(all.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);

        let tail = store.list_job_logs(job_id, 100, Some(2)).await.unwrap();
        assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![3, 4, 5]);
    }
}
