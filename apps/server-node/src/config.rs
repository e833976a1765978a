use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use common::{NodeId, NodeType};

use crate::cache::{CacheConfig, MAX_TTL};
use crate::failover::PeerDescriptor;

#[derive(Debug, Clone)]
pub struct PeerHeartbeatConfig {
    pub enabled: bool,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub bind_addr: SocketAddr,
    pub public_url: String,
    pub peers: Vec<PeerDescriptor>,
    pub cache: CacheConfig,
    pub decay_interval: Option<Duration>,
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    pub peer_timeout: Option<Duration>,
    pub heartbeat: PeerHeartbeatConfig,
    pub warm_peers_on_fill: bool,
    pub catalog_path: Option<PathBuf>,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let node_id = var("EDGEFRONT_NODE_ID")
            .map(NodeId::new)
            .unwrap_or_else(|| NodeId::new(format!("node-{}", uuid::Uuid::new_v4())));

        let node_type = match var("EDGEFRONT_NODE_TYPE") {
            Some(raw) => raw
                .parse::<NodeType>()
                .map_err(|err| anyhow!(err))
                .context("invalid EDGEFRONT_NODE_TYPE")?,
            None => NodeType::Primary,
        };

        let bind_addr = var("EDGEFRONT_SERVER_BIND")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse::<SocketAddr>()
            .context("invalid EDGEFRONT_SERVER_BIND")?;

        let public_url = var("EDGEFRONT_PUBLIC_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("http://{bind_addr}"));

        let peers = match var("EDGEFRONT_PEERS") {
            Some(raw) => parse_peers(&raw, &node_id)?,
            None => Vec::new(),
        };

        let defaults = CacheConfig::default();
        let cache = CacheConfig {
            capacity_bytes: parse_var(&var, "EDGEFRONT_CACHE_CAPACITY_BYTES")?
                .unwrap_or(defaults.capacity_bytes),
            default_ttl: parse_var(&var, "EDGEFRONT_CACHE_DEFAULT_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_ttl),
            eviction_batch_limit: parse_var::<usize>(&var, "EDGEFRONT_CACHE_EVICTION_BATCH_LIMIT")?
                .filter(|limit| *limit > 0),
        };
        if cache.capacity_bytes == 0 {
            bail!("EDGEFRONT_CACHE_CAPACITY_BYTES must be greater than zero");
        }
        if cache.default_ttl > MAX_TTL {
            bail!(
                "EDGEFRONT_CACHE_DEFAULT_TTL_SECS must be at most {}",
                MAX_TTL.as_secs()
            );
        }

        let decay_interval = parse_var::<u64>(&var, "EDGEFRONT_CACHE_DECAY_INTERVAL_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let health_interval = Duration::from_secs(
            parse_var(&var, "EDGEFRONT_HEALTH_INTERVAL_SECS")?.unwrap_or(30),
        );
        let probe_timeout = Duration::from_millis(
            parse_var(&var, "EDGEFRONT_HEALTH_PROBE_TIMEOUT_MS")?.unwrap_or(2_000),
        );

        let peer_timeout = match parse_var::<u64>(&var, "EDGEFRONT_PEER_TIMEOUT_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(Duration::from_secs(90)),
        };

        let heartbeat = PeerHeartbeatConfig {
            enabled: parse_bool(&var, "EDGEFRONT_PEER_HEARTBEAT_ENABLED")?.unwrap_or(true),
            interval: Duration::from_secs(
                parse_var(&var, "EDGEFRONT_PEER_HEARTBEAT_INTERVAL_SECS")?.unwrap_or(15),
            ),
        };
        if heartbeat.enabled
            && let Some(timeout) = peer_timeout
            && heartbeat.interval >= timeout
        {
            bail!(
                "EDGEFRONT_PEER_HEARTBEAT_INTERVAL_SECS ({}s) must be shorter than \
                 EDGEFRONT_PEER_TIMEOUT_SECS ({}s)",
                heartbeat.interval.as_secs(),
                timeout.as_secs()
            );
        }

        Ok(Self {
            node_id,
            node_type,
            bind_addr,
            public_url,
            peers,
            cache,
            decay_interval,
            health_interval,
            probe_timeout,
            peer_timeout,
            heartbeat,
            warm_peers_on_fill: parse_bool(&var, "EDGEFRONT_WARM_PEERS_ON_FILL")?.unwrap_or(false),
            catalog_path: var("EDGEFRONT_CATALOG_PATH").map(PathBuf::from),
        })
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(name)
        .map(|raw| {
            raw.parse::<T>()
                .with_context(|| format!("invalid {name}: {raw}"))
        })
        .transpose()
}

fn parse_bool(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<bool>> {
    var(name)
        .map(|raw| match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(anyhow!("invalid {name}: {raw}")),
        })
        .transpose()
}

/// Parses `id=type=url` entries separated by commas. Declaration order is
/// failover priority among nodes of the same type.
pub fn parse_peers(raw: &str, local_node: &NodeId) -> Result<Vec<PeerDescriptor>> {
    let mut seen = HashSet::new();
    let mut peers = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let mut parts = entry.splitn(3, '=');
        let (Some(id), Some(node_type), Some(url)) = (parts.next(), parts.next(), parts.next())
        else {
            bail!("invalid peer entry {entry:?}, expected id=type=url");
        };

        let node_id = NodeId::new(id.trim());
        if node_id.as_str().is_empty() {
            bail!("invalid peer entry {entry:?}, empty node id");
        }
        if &node_id == local_node {
            bail!("peer list contains the local node id {node_id}");
        }
        if !seen.insert(node_id.clone()) {
            bail!("duplicate peer node id {node_id}");
        }

        let node_type = node_type
            .parse::<NodeType>()
            .map_err(|err| anyhow!(err))
            .with_context(|| format!("invalid peer entry {entry:?}"))?;

        let public_url = url.trim().trim_end_matches('/').to_string();
        if !public_url.starts_with("http://") && !public_url.starts_with("https://") {
            bail!("invalid peer entry {entry:?}, url must be http(s)");
        }

        peers.push(PeerDescriptor {
            node_id,
            node_type,
            public_url,
        });
    }

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<NodeConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NodeConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = config_from(&[]).unwrap();

        assert!(config.node_id.as_str().starts_with("node-"));
        assert_eq!(config.node_type, NodeType::Primary);
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.public_url, "http://127.0.0.1:8080");
        assert!(config.peers.is_empty());
        assert_eq!(config.cache.capacity_bytes, 64 * 1024 * 1024);
        assert_eq!(config.cache.default_ttl, Duration::from_secs(300));
        assert_eq!(config.cache.eviction_batch_limit, None);
        assert_eq!(config.decay_interval, None);
        assert_eq!(config.health_interval, Duration::from_secs(30));
        assert_eq!(config.probe_timeout, Duration::from_millis(2_000));
        assert_eq!(config.peer_timeout, Some(Duration::from_secs(90)));
        assert!(config.heartbeat.enabled);
        assert!(!config.warm_peers_on_fill);
        assert_eq!(config.catalog_path, None);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = config_from(&[
            ("EDGEFRONT_NODE_ID", "edge-1"),
            ("EDGEFRONT_NODE_TYPE", "edge"),
            ("EDGEFRONT_SERVER_BIND", "0.0.0.0:9000"),
            ("EDGEFRONT_PUBLIC_URL", "http://edge-1.local:9000/"),
            ("EDGEFRONT_CACHE_CAPACITY_BYTES", "1024"),
            ("EDGEFRONT_CACHE_EVICTION_BATCH_LIMIT", "16"),
            ("EDGEFRONT_CACHE_DECAY_INTERVAL_SECS", "600"),
            ("EDGEFRONT_PEER_TIMEOUT_SECS", "0"),
            ("EDGEFRONT_PEER_HEARTBEAT_ENABLED", "off"),
            ("EDGEFRONT_WARM_PEERS_ON_FILL", "true"),
        ])
        .unwrap();

        assert_eq!(config.node_id, NodeId::from("edge-1"));
        assert_eq!(config.node_type, NodeType::Edge);
        assert_eq!(config.public_url, "http://edge-1.local:9000");
        assert_eq!(config.cache.capacity_bytes, 1024);
        assert_eq!(config.cache.eviction_batch_limit, Some(16));
        assert_eq!(config.decay_interval, Some(Duration::from_secs(600)));
        assert_eq!(config.peer_timeout, None);
        assert!(!config.heartbeat.enabled);
        assert!(config.warm_peers_on_fill);
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = config_from(&[("EDGEFRONT_CACHE_CAPACITY_BYTES", "lots")]).unwrap_err();
        assert!(err.to_string().contains("EDGEFRONT_CACHE_CAPACITY_BYTES"));

        assert!(config_from(&[("EDGEFRONT_CACHE_CAPACITY_BYTES", "0")]).is_err());
        assert!(config_from(&[("EDGEFRONT_NODE_TYPE", "satellite")]).is_err());
        assert!(config_from(&[("EDGEFRONT_PEER_HEARTBEAT_ENABLED", "maybe")]).is_err());
    }

    #[test]
    fn default_ttl_beyond_maximum_is_rejected() {
        let err = config_from(&[("EDGEFRONT_CACHE_DEFAULT_TTL_SECS", "18446744073709551615")])
            .unwrap_err();
        assert!(err.to_string().contains("EDGEFRONT_CACHE_DEFAULT_TTL_SECS"));

        let max = MAX_TTL.as_secs().to_string();
        let config = config_from(&[("EDGEFRONT_CACHE_DEFAULT_TTL_SECS", max.as_str())]).unwrap();
        assert_eq!(config.cache.default_ttl, MAX_TTL);
    }

    #[test]
    fn heartbeat_interval_must_beat_peer_timeout() {
        let err = config_from(&[
            ("EDGEFRONT_PEER_HEARTBEAT_INTERVAL_SECS", "120"),
            ("EDGEFRONT_PEER_TIMEOUT_SECS", "90"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("EDGEFRONT_PEER_TIMEOUT_SECS"));

        assert!(
            config_from(&[
                ("EDGEFRONT_PEER_HEARTBEAT_INTERVAL_SECS", "120"),
                ("EDGEFRONT_PEER_TIMEOUT_SECS", "0"),
            ])
            .is_ok()
        );
        assert!(
            config_from(&[
                ("EDGEFRONT_PEER_HEARTBEAT_INTERVAL_SECS", "120"),
                ("EDGEFRONT_PEER_HEARTBEAT_ENABLED", "false"),
            ])
            .is_ok()
        );

        let slow_probe = config_from(&[("EDGEFRONT_HEALTH_INTERVAL_SECS", "120")]).unwrap();
        assert_eq!(slow_probe.health_interval, Duration::from_secs(120));
    }

    #[test]
    fn parse_peers_keeps_declaration_order() {
        let peers = parse_peers(
            "backup=mobile-backup=http://10.0.0.2:8080/, edge-1=edge=http://10.0.0.3:8080",
            &NodeId::from("primary"),
        )
        .unwrap();

        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].node_id, NodeId::from("backup"));
        assert_eq!(peers[0].node_type, NodeType::Backup);
        assert_eq!(peers[0].public_url, "http://10.0.0.2:8080");
        assert_eq!(peers[1].node_type, NodeType::Edge);
    }

    #[test]
    fn parse_peers_rejects_duplicates_and_local_node() {
        let local = NodeId::from("primary");

        assert!(parse_peers("a=edge=http://a,a=edge=http://b", &local).is_err());
        assert!(parse_peers("primary=primary=http://a", &local).is_err());
        assert!(parse_peers("a=edge", &local).is_err());
        assert!(parse_peers("a=edge=ftp://a", &local).is_err());
    }
}
