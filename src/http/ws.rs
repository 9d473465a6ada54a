//! The node WebSocket endpoint (`GET /ws`): upgrades the connection,
//! registers it with the [`crate::registry::Registry`], and runs the
//! per-connection read loop plus a dedicated writer task (§4.2, §5).

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};

use crate::app::SharedState;
use crate::envelope;
use crate::model::{NodeMetadata, NodeStatus};
use crate::registry::OutboundFrame;

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<SharedState>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: SharedState) {
    let conn = state.registry.connect().await;
    let node_id = conn.node_id;
    tracing::info!(%node_id, "node connected");

    if let Err(err) = state.store.upsert_node(&NodeMetadata::freshly_connected(node_id)).await {
        tracing::error!(%node_id, error = %err, "failed to persist freshly connected node");
    }

    let (mut sink, mut stream) = socket.split();
    let mut outbound_rx = conn.outbound_rx;

    // Dedicated writer task: all sends to this node funnel through the
    // registry's per-connection channel, so they are strictly ordered and a
    // slow peer only stalls its own queue (§5). It also owns the transport's
    // `Ping` frames so the health monitor's probes interleave correctly with
    // application traffic.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let message = match frame {
                OutboundFrame::Json(value) => Message::Text(value.to_string()),
                OutboundFrame::Ping(payload) => Message::Ping(payload),
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    state.registry.send_to(node_id, envelope::welcome(node_id)).await;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(err) = envelope::route(&state.store, &state.registry, node_id, &text).await {
                            tracing::error!(%node_id, error = %err, "failed to route inbound frame");
                        }
                    },
                    Some(Ok(Message::Ping(_))) => {
                        state.registry.touch(node_id).await;
                    },
                    Some(Ok(Message::Pong(_))) => {
                        state.registry.touch(node_id).await;
                        state.registry.notify_pong(node_id).await;
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {
                        tracing::debug!(%node_id, "ignoring binary frame");
                    },
                    Some(Err(err)) => {
                        tracing::warn!(%node_id, error = %err, "read error, closing connection");
                        break;
                    },
                }
            },
        }
    }

    state.registry.set_status(node_id, NodeStatus::Offline).await;
    if let Some(client) = state.registry.get(node_id).await {
        let node = crate::model::NodeMetadata {
            node_id,
            display_name: client.display_name,
            tags: client.tags,
            capabilities: client.capabilities,
            status: NodeStatus::Offline,
            last_seen: chrono::Utc::now(),
        };
        if let Err(err) = state.store.upsert_node(&node).await {
            tracing::error!(%node_id, error = %err, "failed to persist offline status");
        }
    }
    state.registry.disconnect(node_id).await;
    writer.abort();
    tracing::info!(%node_id, "node disconnected");
}
