//! Health Monitor (C4): periodically probes every live connection and keeps
//! the registry's view of liveness honest.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::model::NodeStatus;
use crate::registry::Registry;

#[derive(Clone, Copy, Debug)]
pub struct HealthConfig {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// A single outcome of probing one client, abstracted away from the
/// transport so this module doesn't need to know about WebSockets. The
/// HTTP/websocket layer supplies the actual `Ping` mechanics; this function
/// just applies the result.
pub enum ProbeOutcome {
    Alive,
    TimedOut,
    Closed,
}

/// Applies the outcome of one probe to the registry (§4.4).
pub async fn apply_probe_outcome(registry: &Registry, node_id: uuid::Uuid, outcome: ProbeOutcome) {
    match outcome {
        ProbeOutcome::Alive => registry.touch(node_id).await,
        ProbeOutcome::TimedOut => {
            tracing::warn!(%node_id, "health probe timed out");
            registry.set_status(node_id, NodeStatus::Unresponsive).await;
        },
        ProbeOutcome::Closed => {
            tracing::info!(%node_id, "connection closed during probe");
            registry.set_status(node_id, NodeStatus::Offline).await;
        },
    }
}

/// Runs the periodic probe loop until `shutdown` is triggered. `probe`
/// performs the actual transport-level ping for one client and returns its
/// outcome; it is injected so this module stays transport-agnostic and
/// testable without a live socket.
pub async fn run<F, Fut>(
    registry: &Registry,
    config: HealthConfig,
    shutdown: CancellationToken,
    probe: F,
) where
    F: Fn(uuid::Uuid) -> Fut,
    Fut: std::future::Future<Output = ProbeOutcome>,
{
    let mut ticker = tokio::time::interval(config.probe_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("health monitor shutting down");
                return;
            },
            _ = ticker.tick() => {},
        }

        let clients = registry.snapshot().await;
        let probes = clients.into_iter().map(|client| {
            let registry = &*registry;
            let probe = &probe;
            async move {
                let outcome = match tokio::time::timeout(config.probe_timeout, probe(client.node_id)).await {
                    Ok(outcome) => outcome,
                    Err(_) => ProbeOutcome::TimedOut,
                };
                apply_probe_outcome(registry, client.node_id, outcome).await;
            }
        });
        futures::future::join_all(probes).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn alive_probe_touches_last_seen_and_restores_online() {
        let registry = Registry::new();
        let conn = registry.connect().await;
        registry.set_status(conn.node_id, NodeStatus::Unresponsive).await;

        apply_probe_outcome(&registry, conn.node_id, ProbeOutcome::Alive).await;

        assert_eq!(registry.get(conn.node_id).await.unwrap().status, NodeStatus::Online);
    }

    #[tokio::test]
    async fn timeout_marks_unresponsive_not_offline() {
        let registry = Registry::new();
        let conn = registry.connect().await;

        apply_probe_outcome(&registry, conn.node_id, ProbeOutcome::TimedOut).await;

        assert_eq!(registry.get(conn.node_id).await.unwrap().status, NodeStatus::Unresponsive);
    }

    #[tokio::test]
    async fn closed_marks_offline() {
        let registry = Registry::new();
        let conn = registry.connect().await;

        apply_probe_outcome(&registry, conn.node_id, ProbeOutcome::Closed).await;

        assert_eq!(registry.get(conn.node_id).await.unwrap().status, NodeStatus::Offline);
    }
}
