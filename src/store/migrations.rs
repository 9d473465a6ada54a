//! Forward-only SQL migrations, applied once at startup and recorded in
//! `schema_migrations` (§3: "Schema evolution" resolution).

use sqlx::SqlitePool;

struct Migration {
    version: i64,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: r#"
        CREATE TABLE IF NOT EXISTS jobs (
            job_id TEXT PRIMARY KEY,
            prompt TEXT NOT NULL,
            status TEXT NOT NULL,
            target_node_id TEXT,
            requested_tags TEXT NOT NULL,
            repositories TEXT NOT NULL,
            metadata TEXT NOT NULL,
            log_path TEXT,
            result_summary TEXT,
            error_message TEXT,
            created_at TEXT NOT NULL,
            finished_at TEXT
        );

        CREATE INDEX IF NOT EXISTS jobs_status_created_at
            ON jobs (status, created_at);

        CREATE TABLE IF NOT EXISTS nodes (
            node_id TEXT PRIMARY KEY,
            display_name TEXT,
            tags TEXT NOT NULL,
            capabilities TEXT NOT NULL,
            status TEXT NOT NULL,
            last_seen TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS job_logs (
            job_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            timestamp TEXT NOT NULL,
            level TEXT NOT NULL,
            message TEXT NOT NULL,
            PRIMARY KEY (job_id, seq)
        );

        CREATE TABLE IF NOT EXISTS user_tokens (
            user_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            access_token TEXT NOT NULL,
            refresh_token TEXT,
            expires_at TEXT,
            metadata TEXT NOT NULL,
            PRIMARY KEY (user_id, provider)
        );
    "#,
}];

/// Applies every migration whose version is not yet recorded, in order.
/// Each migration's DDL is idempotent (`IF NOT EXISTS`) so a partially
/// applied run can be safely retried.
pub async fn run(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL)",
    )
    .execute(pool)
    .await?;

    for migration in MIGRATIONS {
        let already_applied: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM schema_migrations WHERE version = ?")
                .bind(migration.version)
                .fetch_optional(pool)
                .await?;
        if already_applied.is_some() {
            continue;
        }

        let mut tx = pool.begin().await?;
        sqlx::query(migration.sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, datetime('now'))")
            .bind(migration.version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(version = migration.version, "applied schema migration");
    }

    Ok(())
}
