use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use client_sdk::PeerClient;
use common::NodeId;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::cache::{BoundedCache, CacheError};
use crate::failover::{FailoverAggregator, PeerDescriptor};
use crate::health::{HealthMonitor, unix_ts_millis};

/// Applies cache mutations requested by peer nodes.
///
/// Not transactional: each node keeps whatever write it observed last.
#[derive(Clone)]
pub struct EdgeSyncGateway {
    cache: Arc<Mutex<BoundedCache>>,
    failover: Arc<Mutex<FailoverAggregator>>,
}

impl EdgeSyncGateway {
    pub fn new(cache: Arc<Mutex<BoundedCache>>, failover: Arc<Mutex<FailoverAggregator>>) -> Self {
        Self { cache, failover }
    }

    pub async fn push_entry(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
        source: &NodeId,
    ) -> Result<(), CacheError> {
        self.note_source_alive(source).await;

        let size_bytes = value.len();
        self.cache.lock().await.put(key, value, ttl)?;
        debug!(key = %key, source = %source, size_bytes, "stored pushed entry");
        Ok(())
    }

    pub async fn pull_entry(&self, key: &str) -> Option<Bytes> {
        self.cache.lock().await.get(key)
    }

    pub async fn invalidate_entry(&self, key: &str, source: Option<&NodeId>) -> bool {
        if let Some(source) = source {
            self.note_source_alive(source).await;
        }

        let removed = self.cache.lock().await.remove(key);
        if removed {
            debug!(key = %key, "invalidated entry on peer request");
        }
        removed
    }

    async fn note_source_alive(&self, source: &NodeId) {
        let mut failover = self.failover.lock().await;
        let record = failover.fresh_peer_record(source, unix_ts_millis());
        failover.report_peer(source.clone(), record);
    }
}

pub(crate) fn peer_http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

/// Pushes this node's health record to every configured peer, forever.
pub async fn run_peer_heartbeat(
    health: Arc<HealthMonitor>,
    peers: Vec<PeerDescriptor>,
    interval: Duration,
    request_timeout: Duration,
) {
    if peers.is_empty() {
        return;
    }

    let http = peer_http_client(request_timeout);
    let clients: Vec<(NodeId, PeerClient)> = peers
        .iter()
        .map(|peer| {
            (
                peer.node_id.clone(),
                PeerClient::with_client(http.clone(), peer.public_url.as_str()),
            )
        })
        .collect();

    info!(peers = clients.len(), ?interval, "peer heartbeat started");

    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let record = health.record().await;

        for (peer_id, client) in &clients {
            if let Err(err) = client.heartbeat(&record).await {
                debug!(peer = %peer_id, error = %err, "peer heartbeat failed");
            }
        }
    }
}

/// Pushes a freshly filled entry to every peer. Returns how many accepted it.
pub async fn warm_peers(
    http: reqwest::Client,
    peers: Vec<PeerDescriptor>,
    source: NodeId,
    key: String,
    payload: Bytes,
) -> usize {
    let value = match serde_json::from_slice::<serde_json::Value>(&payload) {
        Ok(value) => value,
        Err(err) => {
            debug!(key = %key, error = %err, "skipping peer warm-up for non-JSON entry");
            return 0;
        }
    };

    let mut warmed = 0usize;
    for peer in &peers {
        let client = PeerClient::with_client(http.clone(), peer.public_url.as_str());
        match client.push(key.as_str(), value.clone(), None, &source).await {
            Ok(()) => warmed += 1,
            Err(err) => debug!(peer = %peer.node_id, key = %key, error = %err, "peer warm-up failed"),
        }
    }

    warmed
}
