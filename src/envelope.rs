//! Message Codec & Router (C3): the JSON frame shapes exchanged with nodes
//! and the pure routing logic that turns an inbound frame into Store/
//! Registry effects. Kept free of any WebSocket-specific types so it can be
//! unit tested without a live socket; `src/http` wires it to the transport.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::model::{Job, JobStatusUpdate, LogLevel, NodeStatus};
use crate::registry::Registry;
use crate::store::Store;

/// Every shape a node may send us, discriminated by a `type` tag — the
/// sum-typed replacement for attribute-dispatch called for in the design
/// notes. Anything that doesn't parse as one of these falls through to the
/// chat-broadcast path in [`route`], never treated as fatal.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    #[serde(rename = "node.hello")]
    NodeHello {
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        capabilities: HashMap<String, String>,
    },
    #[serde(rename = "job.status")]
    JobStatus {
        job_id: Uuid,
        #[serde(flatten)]
        update: JobStatusUpdate,
    },
    #[serde(rename = "job.log")]
    JobLog {
        job_id: Uuid,
        #[serde(default)]
        level: String,
        message: String,
    },
}

/// Builds the `welcome` envelope sent the instant a connection is accepted.
pub fn welcome(node_id: Uuid) -> Value {
    json!({
        "type": "welcome",
        "client_id": node_id,
        "message": "connected",
    })
}

/// Builds a `message` envelope relaying free-form text from `from` (a node
/// id, or `"master"` for operator-originated sends).
pub fn chat_message(from: &str, payload: &str) -> Value {
    json!({
        "type": "message",
        "from": from,
        "payload": payload,
    })
}

/// Builds the `job.assign` envelope (§4.5). `workdir` is advisory, derived
/// by the caller from a configured root joined with the job id.
pub fn job_assign(job: &Job, workdir: &str) -> Value {
    json!({
        "type": "job.assign",
        "job_id": job.job_id,
        "prompt": job.prompt,
        "repositories": job.repositories,
        "workdir": workdir,
        "metadata": job.metadata,
        "requested_tags": job.requested_tags,
        "target_node_id": job.target_node_id,
    })
}

/// Parses and applies one inbound frame. Always touches `last_seen`/status
/// bookkeeping first (§4.3: "every inbound message updates the Client's
/// last-seen timestamp"), then dispatches. Returns `Ok(())` whether or not
/// the frame matched a known shape — malformed or unrecognised frames are
/// treated as chat, never as an error to propagate to the caller.
pub async fn route(store: &Store, registry: &Registry, sender_id: Uuid, raw: &str) -> Result<(), crate::store::StoreError> {
    registry.touch(sender_id).await;

    match serde_json::from_str::<InboundMessage>(raw) {
        Ok(InboundMessage::NodeHello { display_name, tags, capabilities }) => {
            registry.apply_hello(sender_id, display_name.clone(), tags.clone(), capabilities.clone()).await;
            if let Some(client) = registry.get(sender_id).await {
                let node = crate::model::NodeMetadata {
                    node_id: sender_id,
                    display_name,
                    tags,
                    capabilities,
                    status: client.status,
                    last_seen: client.last_seen,
                };
                store.upsert_node(&node).await?;
            }
        },
        Ok(InboundMessage::JobStatus { job_id, update }) => {
            store.update_job_status(job_id, &update).await?;
            let runtime_status = if update.status.is_terminal() {
                NodeStatus::Online
            } else if update.status == crate::model::JobStatus::Running {
                NodeStatus::Busy
            } else {
                NodeStatus::Online
            };
            registry.set_status(sender_id, runtime_status).await;
        },
        Ok(InboundMessage::JobLog { job_id, level, message }) => {
            let level: LogLevel = level.parse().unwrap_or(LogLevel::Info);
            store.append_job_log(job_id, level, &message).await?;
        },
        Err(_) => {
            let from = sender_id.to_string();
            registry.broadcast_except(Some(sender_id), chat_message(&from, raw)).await;
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_node_hello() {
        let raw = r#"{"type":"node.hello","display_name":"w1","tags":["gpu"],"capabilities":{"ram":"64gb"}}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        match msg {
            InboundMessage::NodeHello { display_name, tags, capabilities } => {
                assert_eq!(display_name.as_deref(), Some("w1"));
                assert_eq!(tags, vec!["gpu".to_string()]);
                assert_eq!(capabilities.get("ram").map(String::as_str), Some("64gb"));
            },
            _ => panic!("expected NodeHello"),
        }
    }

    #[test]
    fn parses_job_status_with_sparse_fields() {
        let job_id = Uuid::new_v4();
        let raw = format!(r#"{{"type":"job.status","job_id":"{job_id}","status":"succeeded","result_summary":"done"}}"#);
        let msg: InboundMessage = serde_json::from_str(&raw).unwrap();
        match msg {
            InboundMessage::JobStatus { job_id: parsed_id, update } => {
                assert_eq!(parsed_id, job_id);
                assert_eq!(update.status, crate::model::JobStatus::Succeeded);
                assert_eq!(update.result_summary.as_deref(), Some("done"));
                assert!(update.log_path.is_none());
            },
            _ => panic!("expected JobStatus"),
        }
    }

    #[test]
    fn unrecognised_type_fails_to_parse_as_a_known_message() {
        let raw = r#"{"type":"banter","text":"hello there"}"#;
        assert!(serde_json::from_str::<InboundMessage>(raw).is_err());
    }

    #[test]
    fn job_assign_envelope_has_the_documented_shape() {
        let job = Job::new_submission("do a thing".to_string(), None, vec![], vec![], HashMap::new());
        let envelope = job_assign(&job, "/work/abc");
        assert_eq!(envelope["type"], "job.assign");
        assert_eq!(envelope["workdir"], "/work/abc");
        assert_eq!(envelope["job_id"], job.job_id.to_string());
    }
}
