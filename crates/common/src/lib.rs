use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Deployment role of a node. Declaration order is failover priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Primary,
    Backup,
    Edge,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Backup => "backup",
            Self::Edge => "edge",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "backup" | "mobile-backup" | "mobile_backup" => Ok(Self::Backup),
            "edge" => Ok(Self::Edge),
            other => Err(format!("unknown node type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeHealthRecord {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub state: HealthState,
    pub reachable_storage: bool,
    /// Unix milliseconds of the last probe, 0 if the node was never probed.
    pub last_checked_at: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub size_bytes: usize,
    pub capacity_bytes: usize,
    pub hit_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestCounters {
    pub total: u64,
    pub inflight: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    pub node: NodeHealthRecord,
    pub cache: CacheStats,
    pub requests: RequestCounters,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailoverStatus {
    pub active_node: Option<NodeId>,
    pub degraded: bool,
    pub local_node: NodeHealthRecord,
    pub known_peers: BTreeMap<NodeId, NodeHealthRecord>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Push,
    Pull,
    Invalidate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncRequest {
    pub action: SyncAction,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// TTL in seconds; the receiving node's default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node_id: Option<NodeId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Stored,
    Found,
    NotFound,
    Invalidated,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncResponse {
    pub status: SyncOutcome,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_parses_aliases() {
        assert_eq!("Primary".parse::<NodeType>(), Ok(NodeType::Primary));
        assert_eq!("mobile-backup".parse::<NodeType>(), Ok(NodeType::Backup));
        assert_eq!(" edge ".parse::<NodeType>(), Ok(NodeType::Edge));
        assert!("satellite".parse::<NodeType>().is_err());
    }

    #[test]
    fn node_type_order_is_failover_priority() {
        assert!(NodeType::Primary < NodeType::Backup);
        assert!(NodeType::Backup < NodeType::Edge);
    }

    #[test]
    fn sync_request_omits_absent_fields() {
        let request = SyncRequest {
            action: SyncAction::Pull,
            key: "product:7".to_string(),
            value: None,
            ttl: None,
            source_node_id: None,
        };

        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(
            encoded,
            serde_json::json!({ "action": "pull", "key": "product:7" })
        );
    }

    #[test]
    fn failover_status_serializes_missing_active_node_as_null() {
        let local = NodeHealthRecord {
            node_id: NodeId::from("primary"),
            node_type: NodeType::Primary,
            state: HealthState::Unhealthy,
            reachable_storage: false,
            last_checked_at: 10,
            uptime_seconds: 1,
        };
        let status = FailoverStatus {
            active_node: None,
            degraded: true,
            local_node: local,
            known_peers: BTreeMap::new(),
        };

        let encoded = serde_json::to_value(&status).unwrap();
        assert!(encoded["active_node"].is_null());
        assert_eq!(encoded["local_node"]["node_type"], "primary");
        assert_eq!(encoded["local_node"]["state"], "unhealthy");
    }
}
