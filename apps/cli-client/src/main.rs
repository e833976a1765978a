use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use client_sdk::PeerClient;
use common::NodeId;

#[derive(Debug, Parser)]
#[command(name = "edgefront")]
#[command(about = "Operator CLI for edgefront storefront nodes")]
struct Cli {
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server_url: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Local health record, cache statistics and request counters.
    Health,
    /// Which node is currently active, plus every known peer.
    Status,
    /// Store a JSON value in the node's cache.
    Push {
        key: String,
        value: String,
        #[arg(long)]
        ttl: Option<u64>,
        #[arg(long, default_value = "edgefront-cli")]
        source: String,
    },
    Pull {
        key: String,
    },
    Invalidate {
        key: String,
        #[arg(long, default_value = "edgefront-cli")]
        source: String,
    },
    ClearCache,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = PeerClient::new(&cli.server_url);

    match cli.command {
        Commands::Health => {
            let health = client.health().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        Commands::Status => {
            let status = client.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Push {
            key,
            value,
            ttl,
            source,
        } => {
            let value = parse_value(&value)?;
            client
                .push(key.as_str(), value, ttl, &NodeId::new(source))
                .await?;
            println!("stored '{key}'");
        }
        Commands::Pull { key } => match client.pull(key.as_str()).await? {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => bail!("key '{key}' not found"),
        },
        Commands::Invalidate { key, source } => {
            if client.invalidate(key.as_str(), &NodeId::new(source)).await? {
                println!("invalidated '{key}'");
            } else {
                println!("'{key}' was not cached");
            }
        }
        Commands::ClearCache => {
            let report = client.clear_cache().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

/// Accepts any JSON document; a bare word is stored as a JSON string.
fn parse_value(raw: &str) -> Result<serde_json::Value> {
    match serde_json::from_str(raw) {
        Ok(value) => Ok(value),
        Err(_) if !raw.trim_start().starts_with(['{', '[', '"']) => {
            Ok(serde_json::Value::String(raw.to_string()))
        }
        Err(err) => Err(err).context("value is not valid JSON"),
    }
}
