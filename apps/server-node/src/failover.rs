use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use common::{FailoverStatus, HealthState, NodeHealthRecord, NodeId, NodeType};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::health::unix_ts_millis;

/// Statically configured peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub public_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerReport {
    Accepted,
    /// The record is older than the one already held and was dropped.
    Stale,
    IgnoredLocal,
}

/// Decides which node is authoritative from the local record and the last
/// record heard from each peer.
pub struct FailoverAggregator {
    local_node: NodeId,
    priority: Vec<NodeId>,
    peer_types: HashMap<NodeId, NodeType>,
    peer_timeout: Option<Duration>,
    known_peers: BTreeMap<NodeId, NodeHealthRecord>,
    /// Local clock reading of the last report received from each peer.
    last_heard_at: HashMap<NodeId, u64>,
}

impl FailoverAggregator {
    pub fn new(
        local_node: NodeId,
        peers: &[PeerDescriptor],
        peer_timeout: Option<Duration>,
    ) -> Self {
        let mut priority = Vec::with_capacity(peers.len() + 1);
        priority.push(local_node.clone());
        priority.extend(peers.iter().map(|peer| peer.node_id.clone()));

        let peer_types = peers
            .iter()
            .map(|peer| (peer.node_id.clone(), peer.node_type))
            .collect();

        Self {
            local_node,
            priority,
            peer_types,
            peer_timeout,
            known_peers: BTreeMap::new(),
            last_heard_at: HashMap::new(),
        }
    }

    pub fn peer_type(&self, node_id: &NodeId) -> Option<NodeType> {
        self.peer_types.get(node_id).copied()
    }

    pub fn known_peers(&self) -> &BTreeMap<NodeId, NodeHealthRecord> {
        &self.known_peers
    }

    pub fn report_peer(&mut self, node_id: NodeId, record: NodeHealthRecord) -> PeerReport {
        self.report_peer_at(node_id, record, unix_ts_millis())
    }

    /// Applies a peer report received at `heard_at_ms` on the local clock.
    ///
    /// Any report, even one that loses to a newer record, proves the peer is
    /// alive and refreshes its staleness deadline.
    pub fn report_peer_at(
        &mut self,
        node_id: NodeId,
        mut record: NodeHealthRecord,
        heard_at_ms: u64,
    ) -> PeerReport {
        if node_id == self.local_node {
            debug!(node_id = %node_id, "ignoring peer report about the local node");
            return PeerReport::IgnoredLocal;
        }

        let heard_at = self.last_heard_at.entry(node_id.clone()).or_insert(0);
        *heard_at = (*heard_at).max(heard_at_ms);

        if let Some(current) = self.known_peers.get(&node_id)
            && record.last_checked_at < current.last_checked_at
        {
            debug!(
                node_id = %node_id,
                reported = record.last_checked_at,
                held = current.last_checked_at,
                "dropping stale peer report"
            );
            return PeerReport::Stale;
        }

        record.node_id = node_id.clone();
        self.known_peers.insert(node_id, record);
        PeerReport::Accepted
    }

    /// Record stamped "now" for a peer that just contacted this node.
    ///
    /// Keeps the reachability last reported by the peer itself; a peer never
    /// heard from is assumed healthy.
    pub fn fresh_peer_record(&self, node_id: &NodeId, now_ms: u64) -> NodeHealthRecord {
        match self.known_peers.get(node_id) {
            Some(previous) => NodeHealthRecord {
                last_checked_at: now_ms.max(previous.last_checked_at),
                ..previous.clone()
            },
            None => NodeHealthRecord {
                node_id: node_id.clone(),
                node_type: self.peer_type(node_id).unwrap_or(NodeType::Edge),
                state: HealthState::Healthy,
                reachable_storage: true,
                last_checked_at: now_ms,
                uptime_seconds: 0,
            },
        }
    }

    pub fn status(&self, local: &NodeHealthRecord) -> FailoverStatus {
        self.status_at(local, unix_ts_millis())
    }

    pub fn status_at(&self, local: &NodeHealthRecord, now_ms: u64) -> FailoverStatus {
        let mut candidates: Vec<&NodeHealthRecord> = Vec::with_capacity(self.known_peers.len() + 1);
        candidates.push(local);
        candidates.extend(
            self.known_peers
                .values()
                .filter(|record| !self.is_stale(record, now_ms)),
        );

        candidates.sort_by(|a, b| {
            a.node_type
                .cmp(&b.node_type)
                .then_with(|| self.priority_of(&a.node_id).cmp(&self.priority_of(&b.node_id)))
                .then_with(|| a.node_id.cmp(&b.node_id))
        });

        let active_node = candidates
            .into_iter()
            .find(|record| record.reachable_storage)
            .map(|record| record.node_id.clone());

        FailoverStatus {
            degraded: active_node.is_none(),
            active_node,
            local_node: local.clone(),
            known_peers: self.known_peers.clone(),
        }
    }

    /// Measured against when this node last heard from the peer, never
    /// against the peer's own clock.
    fn is_stale(&self, record: &NodeHealthRecord, now_ms: u64) -> bool {
        let Some(timeout) = self.peer_timeout else {
            return false;
        };

        match self.last_heard_at.get(&record.node_id) {
            Some(heard_at) => now_ms.saturating_sub(*heard_at) > timeout.as_millis() as u64,
            None => true,
        }
    }

    fn priority_of(&self, node_id: &NodeId) -> usize {
        self.priority
            .iter()
            .position(|candidate| candidate == node_id)
            .unwrap_or(usize::MAX)
    }
}
