//! Basic docsync Example
//!
//! Two client sessions share one in-memory service: one creates a document,
//! the other finds it, both edit it and the edits converge.
//!
//! Run with: cargo run --example basic -- --log-level debug

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use docsync_core::automerge::transaction::Transactable;
use docsync_core::automerge::ROOT;
use docsync_registry::{DocumentHandleRegistry, RegistryConfig};
use docsync_service::MemoryDataService;

/// docsync walkthrough
#[derive(Parser, Debug)]
#[command(name = "basic")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Registry configuration file (TOML)
    #[arg(short, long, env = "DOCSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "DOCSYNC_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = match &args.config {
        Some(path) => {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            RegistryConfig::from_toml_str(&source)?
        }
        None => RegistryConfig::default(),
    };
    info!(
        max_flush_frequency = config.max_flush_frequency,
        rpc_timeout_ms = config.rpc_timeout_ms,
        "Loaded configuration"
    );

    let service = Arc::new(MemoryDataService::new());
    let alice = DocumentHandleRegistry::new(
        service.clone(),
        config.clone().with_subscription_id("alice"),
    );
    let bob = DocumentHandleRegistry::new(service.clone(), config.with_subscription_id("bob"));
    alice.open().await?;
    bob.open().await?;

    // Alice creates a document and pushes it right away.
    let notes = alice.create_from(&serde_json::json!({
        "title": "Groceries",
        "items": ["milk"],
    }))?;
    alice.flush().await?;
    println!("alice created {}", notes.id());

    // Bob finds it; the handle is pending until the service sends it.
    let replica = bob.find(notes.id().clone());
    bob.flush().await?;
    tokio::time::timeout(Duration::from_secs(5), replica.when_ready())
        .await
        .context("document never arrived")??;
    println!("bob sees   {}", replica.to_json()?);

    // Concurrent edits on both sides.
    notes.change(|tx| tx.put(ROOT, "title", "Groceries (Sat)"))?;
    replica.change(|tx| tx.put(ROOT, "done", false))?;
    alice.flush().await?;
    bob.flush().await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    println!("alice now  {}", notes.to_json()?);
    println!("bob now    {}", replica.to_json()?);
    println!("converged: {}", notes.heads()? == replica.heads()?);

    // Bob drops the document; alice keeps hers.
    replica.delete()?;
    println!("bob membership: {:?}", bob.membership(notes.id()));

    alice.close().await?;
    bob.close().await?;

    let stats = alice.stats();
    println!(
        "alice: {} writes, {} updates sent, {} received",
        stats.writes, stats.updates_sent, stats.updates_received
    );

    Ok(())
}
