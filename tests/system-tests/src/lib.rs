#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::process::Stdio;
    use std::sync::OnceLock;
    use std::time::Duration;

    use anyhow::{Context, Result, bail};
    use client_sdk::PeerClient;
    use common::{FailoverStatus, NodeHealthRecord, NodeId, NodeType};
    use reqwest::StatusCode;
    use serde_json::json;
    use tokio::process::{Child, Command};
    use tokio::time::sleep;

    #[tokio::test]
    async fn sdk_push_pull_roundtrip_against_live_server() -> Result<()> {
        let bind = "127.0.0.1:19180";
        let mut server = start_server(bind, &[]).await?;

        let result = async {
            let client = PeerClient::new(format!("http://{bind}"));
            let source = NodeId::from("system-test");
            let value = json!({ "id": 7, "title": "Travel Mug" });

            client.push("product:7", value.clone(), Some(60), &source).await?;
            assert_eq!(client.pull("product:7").await?, Some(value));
            assert_eq!(client.pull("product:8").await?, None);

            assert!(client.invalidate("product:7", &source).await?);
            assert_eq!(client.pull("product:7").await?, None);

            let health = client.health().await?;
            assert_eq!(health.cache.entries, 0);
            assert!(health.requests.total >= 5);

            Ok::<(), anyhow::Error>(())
        }
        .await;

        stop_server(&mut server).await;
        result
    }

    #[tokio::test]
    async fn cli_push_then_pull_against_live_server() -> Result<()> {
        let bind = "127.0.0.1:19181";
        let base_url = format!("http://{bind}");
        let mut server = start_server(bind, &[]).await?;

        let result = async {
            run_cli(&[
                "--server-url",
                &base_url,
                "push",
                "cli-roundtrip",
                "{\"greeting\":\"hello-from-cli\"}",
                "--ttl",
                "120",
            ])
            .await?;

            let output = run_cli(&["--server-url", &base_url, "pull", "cli-roundtrip"]).await?;
            assert!(output.contains("hello-from-cli"));

            let cleared = run_cli(&["--server-url", &base_url, "clear-cache"]).await?;
            assert!(cleared.contains("\"removed\": 1"));

            assert!(
                run_cli(&["--server-url", &base_url, "pull", "cli-roundtrip"])
                    .await
                    .is_err()
            );

            Ok::<(), anyhow::Error>(())
        }
        .await;

        stop_server(&mut server).await;
        result
    }

    #[tokio::test]
    async fn single_primary_becomes_active_after_first_probe() -> Result<()> {
        let bind = "127.0.0.1:19182";
        let mut server = start_server(
            bind,
            &[
                ("EDGEFRONT_NODE_ID", "primary"),
                ("EDGEFRONT_NODE_TYPE", "primary"),
            ],
        )
        .await?;

        let result = async {
            let status = wait_for_active_node(&format!("http://{bind}"), 40).await?;
            assert_eq!(status.active_node, Some(NodeId::from("primary")));
            assert!(!status.degraded);
            assert!(status.local_node.reachable_storage);
            Ok::<(), anyhow::Error>(())
        }
        .await;

        stop_server(&mut server).await;
        result
    }

    #[tokio::test]
    async fn peer_heartbeats_register_backup_on_primary() -> Result<()> {
        let primary_bind = "127.0.0.1:19183";
        let backup_bind = "127.0.0.1:19184";
        let primary_peers = format!("backup=backup=http://{backup_bind}");
        let backup_peers = format!("primary=primary=http://{primary_bind}");

        let mut primary = start_server(
            primary_bind,
            &[
                ("EDGEFRONT_NODE_ID", "primary"),
                ("EDGEFRONT_NODE_TYPE", "primary"),
                ("EDGEFRONT_PEERS", primary_peers.as_str()),
                ("EDGEFRONT_PEER_HEARTBEAT_INTERVAL_SECS", "1"),
            ],
        )
        .await?;
        let mut backup = match start_server(
            backup_bind,
            &[
                ("EDGEFRONT_NODE_ID", "backup"),
                ("EDGEFRONT_NODE_TYPE", "backup"),
                ("EDGEFRONT_PEERS", backup_peers.as_str()),
                ("EDGEFRONT_PEER_HEARTBEAT_INTERVAL_SECS", "1"),
            ],
        )
        .await
        {
            Ok(child) => child,
            Err(err) => {
                stop_server(&mut primary).await;
                return Err(err);
            }
        };

        let result = wait_for_known_peer(
            &format!("http://{primary_bind}"),
            &NodeId::from("backup"),
            50,
        )
        .await
        .map(|record| assert_eq!(record.node_type, NodeType::Backup));

        stop_server(&mut backup).await;
        stop_server(&mut primary).await;
        result
    }

    #[tokio::test]
    async fn catalog_reads_report_cache_header_and_use_catalog_file() -> Result<()> {
        let bind = "127.0.0.1:19185";
        let catalog_path =
            std::env::temp_dir().join(format!("edgefront-catalog-{}.json", std::process::id()));
        fs::write(
            &catalog_path,
            serde_json::to_vec(&json!([
                { "id": 11, "title": "Hiking Boots", "category": "Outdoor", "price_cents": 990000, "stock": 4 },
                { "id": 12, "title": "Rain Jacket", "category": "Outdoor", "price_cents": 450000, "stock": 9 }
            ]))?,
        )?;

        let catalog_env = catalog_path.display().to_string();
        let mut server = start_server(bind, &[("EDGEFRONT_CATALOG_PATH", catalog_env.as_str())]).await?;

        let result = async {
            let http = reqwest::Client::new();
            let url = format!("http://{bind}/products?category=outdoor");

            let first = http.get(&url).send().await?;
            assert_eq!(first.status(), StatusCode::OK);
            assert_eq!(cache_header(&first), Some("miss".to_string()));
            let listing: serde_json::Value = first.json().await?;
            assert_eq!(listing["total"], 2);

            let second = http.get(&url).send().await?;
            assert_eq!(cache_header(&second), Some("hit".to_string()));

            let missing = http
                .get(format!("http://{bind}/products/1"))
                .send()
                .await?;
            assert_eq!(missing.status(), StatusCode::NOT_FOUND);

            let search_url = format!("http://{bind}/search?q=BOOTS");
            let found = http.get(&search_url).send().await?;
            assert_eq!(cache_header(&found), Some("miss".to_string()));
            let results: serde_json::Value = found.json().await?;
            assert_eq!(results["total"], 1);
            assert_eq!(results["products"][0]["id"], 11);

            let again = http.get(format!("http://{bind}/search?q=boots")).send().await?;
            assert_eq!(cache_header(&again), Some("hit".to_string()));

            Ok::<(), anyhow::Error>(())
        }
        .await;

        stop_server(&mut server).await;
        let _ = fs::remove_file(&catalog_path);
        result
    }

    async fn wait_for_active_node(base_url: &str, retries: usize) -> Result<FailoverStatus> {
        let client = PeerClient::new(base_url);

        for _ in 0..retries {
            let status = client.status().await?;
            if status.active_node.is_some() {
                return Ok(status);
            }
            sleep(Duration::from_millis(100)).await;
        }

        bail!("no active node reported by {base_url}");
    }

    async fn wait_for_known_peer(
        base_url: &str,
        peer: &NodeId,
        retries: usize,
    ) -> Result<NodeHealthRecord> {
        let client = PeerClient::new(base_url);

        for _ in 0..retries {
            let status = client.status().await?;
            if let Some(record) = status.known_peers.get(peer) {
                return Ok(record.clone());
            }
            sleep(Duration::from_millis(100)).await;
        }

        bail!("peer {peer} never reported to {base_url}");
    }

    fn cache_header(response: &reqwest::Response) -> Option<String> {
        response
            .headers()
            .get("x-cache")
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string)
    }

    async fn start_server(bind: &str, envs: &[(&str, &str)]) -> Result<Child> {
        let server_bin = binary_path("server-node")?;

        let mut command = Command::new(server_bin);
        command
            .env("EDGEFRONT_SERVER_BIND", bind)
            .env("EDGEFRONT_PUBLIC_URL", format!("http://{bind}"))
            .envs(envs.iter().copied())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().context("failed to spawn server-node")?;

        if let Err(err) = wait_for_server(bind, 40).await {
            stop_server(&mut child).await;
            return Err(err);
        }
        Ok(child)
    }

    async fn run_cli(args: &[&str]) -> Result<String> {
        let cli_bin = binary_path("edgefront")?;
        let output = Command::new(cli_bin)
            .args(args)
            .output()
            .await
            .context("failed to execute edgefront cli")?;

        if !output.status.success() {
            bail!(
                "edgefront cli failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn wait_for_server(bind: &str, retries: usize) -> Result<()> {
        let health_url = format!("http://{bind}/health");
        let http = reqwest::Client::new();

        for _ in 0..retries {
            if let Ok(resp) = http.get(&health_url).send().await
                && resp.status() == StatusCode::OK
            {
                return Ok(());
            }
            sleep(Duration::from_millis(100)).await;
        }

        bail!("server did not become healthy at {health_url}");
    }

    async fn stop_server(child: &mut Child) {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }

    /// Path of a workspace binary, built once per test run.
    fn binary_path(name: &str) -> Result<PathBuf> {
        static BUILT: OnceLock<Result<PathBuf, String>> = OnceLock::new();

        let target_dir = BUILT
            .get_or_init(|| build_node_and_cli().map_err(|err| format!("{err:#}")))
            .as_ref()
            .map_err(|message| anyhow::anyhow!("building test binaries failed: {message}"))?;

        let path = target_dir.join(format!("{name}{}", std::env::consts::EXE_SUFFIX));
        if !path.exists() {
            bail!("missing binary {}", path.display());
        }
        Ok(path)
    }

    fn build_node_and_cli() -> Result<PathBuf> {
        let workspace = Path::new(env!("CARGO_MANIFEST_DIR"))
            .ancestors()
            .nth(2)
            .context("system-tests crate is not inside the workspace")?;

        let status = std::process::Command::new("cargo")
            .args(["build", "-p", "server-node", "-p", "cli-client"])
            .current_dir(workspace)
            .status()
            .context("failed to run cargo build")?;
        if !status.success() {
            bail!("cargo build exited with {status}");
        }

        Ok(workspace.join("target").join("debug"))
    }
}
