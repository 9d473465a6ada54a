//! Dispatcher (C5): periodically matches eligible jobs to available nodes
//! and hands out `job.assign` envelopes.

use std::path::Path;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::envelope;
use crate::model::{Job, JobStatus, NodeStatus};
use crate::registry::{Client, Registry};
use crate::store::Store;

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub interval: Duration,
    /// Cap on how many pending/queued jobs are loaded per tick (§4.5: 200).
    pub candidate_limit: i64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            candidate_limit: 200,
        }
    }
}

/// Picks at most one job for `client` from `candidates`, per the matching
/// rule in §4.5: a directed QUEUED job targeting this client wins outright;
/// otherwise the oldest PENDING, untargeted job whose tags are a subset of
/// the client's tags. `candidates` is assumed oldest-first (the Store's
/// `list_jobs_by_status` ordering), so the first structural match is the
/// correct pick.
pub fn select_job_for_client<'a>(client: &Client, candidates: &'a [Job]) -> Option<&'a Job> {
    if let Some(directed) = candidates
        .iter()
        .find(|job| job.status == JobStatus::Queued && job.target_node_id == Some(client.node_id))
    {
        return Some(directed);
    }

    candidates.iter().find(|job| {
        job.status == JobStatus::Pending
            && job.target_node_id.is_none()
            && job.requested_tags.iter().all(|tag| client.tags.contains(tag))
    })
}

fn workdir_for(root: &Path, job_id: Uuid) -> String {
    root.join(job_id.to_string()).to_string_lossy().into_owned()
}

/// Runs one dispatch tick: loads candidates, offers each available client
/// at most one job, and removes a job from the in-memory candidate list the
/// instant it is claimed so it isn't offered again within the same tick.
/// `shared_config`'s `workdir_root` is re-read fresh on every call, so a
/// `POST /api/config` overlay takes effect on the very next tick rather than
/// only at process start (§6).
pub async fn tick(
    store: &Store,
    registry: &Registry,
    shared_config: &RwLock<Config>,
    config: &DispatchConfig,
) -> Result<(), crate::store::StoreError> {
    let mut candidates = store
        .list_jobs_by_status(&[JobStatus::Queued, JobStatus::Pending], config.candidate_limit)
        .await?;

    let workdir_root = shared_config.read().await.workdir_root.clone();

    let clients = registry.snapshot().await;

    for client in clients.iter().filter(|c| c.is_available()) {
        let Some(picked) = select_job_for_client(client, &candidates) else {
            continue;
        };
        let job_id = picked.job_id;

        match store.assign_job(job_id, client.node_id).await {
            Ok(true) => {
                if let Some(idx) = candidates.iter().position(|j| j.job_id == job_id) {
                    let mut job = candidates.remove(idx);
                    job.status = JobStatus::Running;
                    job.target_node_id = Some(client.node_id);
                    let workdir = workdir_for(&workdir_root, job_id);
                    registry.send_to(client.node_id, envelope::job_assign(&job, &workdir)).await;
                    registry.set_status(client.node_id, NodeStatus::Busy).await;
                }
            },
            Ok(false) => {
                // Someone else took it between the snapshot and this attempt;
                // drop it from this tick's candidates and move on.
                candidates.retain(|j| j.job_id != job_id);
            },
            Err(err) => {
                tracing::error!(%job_id, error = %err, "assign_job failed");
            },
        }
    }

    Ok(())
}

pub async fn run(
    store: &Store,
    registry: &Registry,
    shared_config: &RwLock<Config>,
    config: DispatchConfig,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("dispatcher shutting down");
                return;
            },
            _ = ticker.tick() => {},
        }

        if let Err(err) = tick(store, registry, shared_config, &config).await {
            tracing::error!(error = %err, "dispatch tick failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::collections::HashMap;

    fn pending_job(tags: Vec<String>) -> Job {
        Job::new_submission("run it".to_string(), None, tags, vec![], HashMap::new())
    }

    fn queued_job_for(node_id: Uuid) -> Job {
        Job::new_submission("run it".to_string(), Some(node_id), vec![], vec![], HashMap::new())
    }

    async fn client_with_tags(tags: Vec<String>) -> Client {
        let registry = Registry::new();
        let conn = registry.connect().await;
        registry
            .apply_hello(conn.node_id, None, tags, HashMap::new())
            .await;
        registry.get(conn.node_id).await.unwrap()
    }

    #[tokio::test]
    async fn directed_match_wins_over_tag_match() {
        let client = client_with_tags(vec!["gpu".to_string()]).await;
        let directed = queued_job_for(client.node_id);
        let tagged = pending_job(vec!["gpu".to_string()]);
        let candidates = vec![tagged.clone(), directed.clone()];

        let picked = select_job_for_client(&client, &candidates).unwrap();
        assert_eq!(picked.job_id, directed.job_id);
    }

    #[tokio::test]
    async fn tag_subset_matches_oldest_first() {
        let client = client_with_tags(vec!["gpu".to_string(), "fast".to_string()]).await;
        let older = pending_job(vec!["gpu".to_string()]);
        let newer = pending_job(vec![]);
        let candidates = vec![older.clone(), newer.clone()];

        let picked = select_job_for_client(&client, &candidates).unwrap();
        assert_eq!(picked.job_id, older.job_id);
    }

    #[tokio::test]
    async fn no_match_when_tags_are_not_a_subset() {
        let client = client_with_tags(vec!["cpu".to_string()]).await;
        let job = pending_job(vec!["gpu".to_string()]);
        let candidates = vec![job];

        assert!(select_job_for_client(&client, &candidates).is_none());
    }

    fn test_config() -> Config {
        let args = crate::config::Args::parse_from(["jobmesh-master"]);
        Config::from_args(&args).unwrap()
    }

    #[tokio::test]
    async fn tick_assigns_exactly_one_job_and_sends_exactly_one_assignment() {
        use crate::registry::OutboundFrame;

        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("jobmesh.sqlite3")).await.unwrap();
        let job = pending_job(vec![]);
        store.upsert_job(&job).await.unwrap();

        let registry = Registry::new();
        let conn_a = registry.connect().await;
        let conn_b = registry.connect().await;
        let mut rx_a = conn_a.outbound_rx;
        let mut rx_b = conn_b.outbound_rx;

        let shared_config = RwLock::new(test_config());
        let dispatch_config = DispatchConfig::default();

        tick(&store, &registry, &shared_config, &dispatch_config).await.unwrap();

        let is_job_assign = |frame: Result<OutboundFrame, tokio::sync::mpsc::error::TryRecvError>| {
            matches!(
                frame,
                Ok(OutboundFrame::Json(value)) if value.get("type").and_then(|t| t.as_str()) == Some("job.assign")
            )
        };
        let assignments = [is_job_assign(rx_a.try_recv()), is_job_assign(rx_b.try_recv())]
            .into_iter()
            .filter(|sent| *sent)
            .count();
        assert_eq!(assignments, 1, "exactly one available client should receive a job.assign");

        let stored = store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
    }
}
