use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use common::{HealthState, NodeHealthRecord, NodeId, NodeType};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::catalog::CatalogStore;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("storage probe failed: {0}")]
    ProbeFailed(String),
    #[error("storage probe timed out after {0:?}")]
    ProbeTimedOut(Duration),
}

#[derive(Debug, Clone, Copy)]
struct ProbeState {
    state: HealthState,
    last_checked_at: u64,
}

/// Tracks whether this node can reach its catalog store.
///
/// Starts `Unknown`; every probe moves it to `Healthy` or `Unhealthy`. A failed
/// probe is only logged, the next tick is the retry.
pub struct HealthMonitor {
    node_id: NodeId,
    node_type: NodeType,
    started_at: Instant,
    probe_timeout: Duration,
    probe_state: RwLock<ProbeState>,
}

impl HealthMonitor {
    pub fn new(node_id: NodeId, node_type: NodeType, probe_timeout: Duration) -> Self {
        Self {
            node_id,
            node_type,
            started_at: Instant::now(),
            probe_timeout,
            probe_state: RwLock::new(ProbeState {
                state: HealthState::Unknown,
                last_checked_at: 0,
            }),
        }
    }

    pub async fn state(&self) -> HealthState {
        self.probe_state.read().await.state
    }

    pub async fn record(&self) -> NodeHealthRecord {
        let probe = *self.probe_state.read().await;

        NodeHealthRecord {
            node_id: self.node_id.clone(),
            node_type: self.node_type,
            state: probe.state,
            reachable_storage: probe.state == HealthState::Healthy,
            last_checked_at: probe.last_checked_at,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    pub async fn probe_once(&self, store: &dyn CatalogStore) -> HealthState {
        let outcome = match tokio::time::timeout(self.probe_timeout, store.probe()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(HealthError::ProbeFailed(format!("{err:#}"))),
            Err(_) => Err(HealthError::ProbeTimedOut(self.probe_timeout)),
        };

        self.apply_probe(outcome, unix_ts_millis()).await
    }

    async fn apply_probe(&self, outcome: Result<(), HealthError>, checked_at: u64) -> HealthState {
        let next = match &outcome {
            Ok(()) => HealthState::Healthy,
            Err(err) => {
                warn!(
                    node_id = %self.node_id,
                    error = %err,
                    "storage probe failed, serving cached data only"
                );
                HealthState::Unhealthy
            }
        };

        let previous = {
            let mut probe = self.probe_state.write().await;
            let previous = probe.state;
            probe.state = next;
            probe.last_checked_at = checked_at;
            previous
        };

        if previous != next {
            info!(
                node_id = %self.node_id,
                from = ?previous,
                to = ?next,
                "node health changed"
            );
        }

        next
    }

    pub async fn run(self: Arc<Self>, store: Arc<dyn CatalogStore>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.probe_once(store.as_ref()).await;
        }
    }
}

pub(crate) fn unix_ts_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
