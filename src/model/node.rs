use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Runtime liveness status of a connected node, as tracked by the health
/// monitor and the message router. Distinct from [`crate::model::JobStatus`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Idle,
    Busy,
    Unresponsive,
    Offline,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Unresponsive => "unresponsive",
            Self::Offline => "offline",
        }
    }

    /// Whether a client in this status may be offered new work by the
    /// dispatcher (§4.5: "ONLINE or IDLE... not BUSY/UNRESPONSIVE").
    pub fn is_available(self) -> bool {
        matches!(self, Self::Online | Self::Idle)
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "online" => Self::Online,
            "idle" => Self::Idle,
            "busy" => Self::Busy,
            "unresponsive" => Self::Unresponsive,
            "offline" => Self::Offline,
            other => return Err(format!("unknown node status '{other}'")),
        })
    }
}

/// Persisted node metadata — the durable view of a node, independent of
/// whether it currently holds a live connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub node_id: Uuid,
    pub display_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub capabilities: HashMap<String, String>,
    pub status: NodeStatus,
    pub last_seen: DateTime<Utc>,
}

impl NodeMetadata {
    /// The row created the moment a node connects, before it has announced
    /// itself with `node.hello`.
    pub fn freshly_connected(node_id: Uuid) -> Self {
        Self {
            node_id,
            display_name: None,
            tags: Vec::new(),
            capabilities: HashMap::new(),
            status: NodeStatus::Online,
            last_seen: Utc::now(),
        }
    }
}
