use anyhow::{Context, Result, bail};
use common::{
    FailoverStatus, HealthStatus, NodeHealthRecord, NodeId, SyncAction, SyncOutcome, SyncRequest,
    SyncResponse,
};
use reqwest::{Client, StatusCode};

/// HTTP client for a single storefront node, used by peers and by the CLI.
#[derive(Clone)]
pub struct PeerClient {
    http: Client,
    base_url: String,
}

impl PeerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<HealthStatus> {
        let url = format!("{}/health", self.base_url);
        self.http
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", self.base_url))?
            .error_for_status()
            .context("health endpoint returned error status")?
            .json::<HealthStatus>()
            .await
            .context("failed to decode health response")
    }

    pub async fn status(&self) -> Result<FailoverStatus> {
        let url = format!("{}/status", self.base_url);
        self.http
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", self.base_url))?
            .error_for_status()
            .context("status endpoint returned error status")?
            .json::<FailoverStatus>()
            .await
            .context("failed to decode failover status")
    }

    pub async fn push(
        &self,
        key: impl Into<String>,
        value: serde_json::Value,
        ttl_secs: Option<u64>,
        source: &NodeId,
    ) -> Result<()> {
        let key = key.into();
        let response = self
            .sync(SyncRequest {
                action: SyncAction::Push,
                key: key.clone(),
                value: Some(value),
                ttl: ttl_secs,
                source_node_id: Some(source.clone()),
            })
            .await?;

        match response.status {
            SyncOutcome::Stored => Ok(()),
            other => bail!(
                "push of key={key} not stored ({other:?}): {}",
                response.error.unwrap_or_default()
            ),
        }
    }

    pub async fn pull(&self, key: impl Into<String>) -> Result<Option<serde_json::Value>> {
        let response = self
            .sync(SyncRequest {
                action: SyncAction::Pull,
                key: key.into(),
                value: None,
                ttl: None,
                source_node_id: None,
            })
            .await?;

        Ok(match response.status {
            SyncOutcome::Found => response.value,
            _ => None,
        })
    }

    pub async fn invalidate(&self, key: impl Into<String>, source: &NodeId) -> Result<bool> {
        let response = self
            .sync(SyncRequest {
                action: SyncAction::Invalidate,
                key: key.into(),
                value: None,
                ttl: None,
                source_node_id: Some(source.clone()),
            })
            .await?;

        Ok(response.status == SyncOutcome::Invalidated)
    }

    pub async fn heartbeat(&self, record: &NodeHealthRecord) -> Result<()> {
        let url = format!("{}/peers/heartbeat", self.base_url);
        self.http
            .post(url)
            .json(record)
            .send()
            .await
            .with_context(|| format!("failed to send heartbeat to {}", self.base_url))?
            .error_for_status()
            .context("peer rejected heartbeat")?;
        Ok(())
    }

    pub async fn clear_cache(&self) -> Result<serde_json::Value> {
        let url = format!("{}/admin/cache/clear", self.base_url);
        self.http
            .post(url)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", self.base_url))?
            .error_for_status()
            .context("cache clear returned error status")?
            .json::<serde_json::Value>()
            .await
            .context("failed to decode cache clear response")
    }

    /// Sends a raw sync request. A 404 is a regular `not_found` answer, not an error.
    pub async fn sync(&self, request: SyncRequest) -> Result<SyncResponse> {
        let url = format!("{}/sync", self.base_url);
        let response = self
            .http
            .post(url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("failed to sync key={} with {}", request.key, self.base_url))?;

        let status = response.status();
        if status.is_success()
            || status == StatusCode::NOT_FOUND
            || status == StatusCode::PAYLOAD_TOO_LARGE
        {
            return response
                .json::<SyncResponse>()
                .await
                .context("failed to decode sync response");
        }

        bail!("sync of key={} failed with status {status}", request.key)
    }
}
