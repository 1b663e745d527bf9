// Copyright (c) 2025 - Cowboy AI, Inc.
//! Synchronization Daemon
//!
//! Connects to the remote event server, runs the full sync pipeline
//! against a local SQLite store, and logs materialization summaries
//! until interrupted.
//!
//! Run with: cargo run --bin tidemark-sync
//!
//! Environment:
//! - NATS_URL          server address (default: nats://localhost:4222)
//! - TIDEMARK_USER     user did (required)
//! - TIDEMARK_TOKEN    app-password token (required)
//! - TIDEMARK_DB       store path (default: tidemark.db)

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use tidemark::{
    Client, ClientConfig, InMemoryProfileFetcher, InMemoryProfileStore, NatsEventServer,
    NatsServerConfig, Session, SqliteStore, StaticTokenProvider, UserId,
};

#[derive(Debug, Clone)]
struct DaemonConfig {
    nats_url: String,
    user: String,
    token: String,
    db_path: PathBuf,
}

impl DaemonConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            nats_url: std::env::var("NATS_URL")
                .unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            user: std::env::var("TIDEMARK_USER").context("TIDEMARK_USER not set")?,
            token: std::env::var("TIDEMARK_TOKEN").context("TIDEMARK_TOKEN not set")?,
            db_path: std::env::var("TIDEMARK_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("tidemark.db")),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = DaemonConfig::from_env()?;
    info!(
        nats = %config.nats_url,
        user = %config.user,
        db = %config.db_path.display(),
        "Starting sync daemon"
    );

    let server = NatsEventServer::connect(NatsServerConfig {
        servers: vec![config.nats_url.clone()],
        ..NatsServerConfig::default()
    })
    .await
    .context("Failed to connect to event server")?;

    let store = SqliteStore::open(&config.db_path).context("Failed to open local store")?;

    let session = Session::new(
        UserId::new(config.user).context("Invalid user id")?,
        Arc::new(StaticTokenProvider::new(config.token)),
    );

    let mut client = Client::connect(
        session,
        Arc::new(server),
        Arc::new(store),
        Arc::new(InMemoryProfileFetcher::new()),
        Arc::new(InMemoryProfileStore::new()),
        ClientConfig::default(),
    )
    .await
    .context("Client startup failed")?;

    info!(user = %client.user(), personal = %client.personal_stream(), "Connected");

    let mut reports = client
        .take_reports()
        .context("Reporting channel already taken")?;
    let reporter = tokio::spawn(async move {
        while let Some(report) = reports.recv().await {
            info!(
                batch = %report.batch_id,
                applied = report.summary.applied,
                stashed = report.summary.stashed,
                errored = report.summary.errored,
                cursor = %report.summary.cursor,
                "Batch materialized"
            );
            if !report.warnings.is_empty() {
                warn!(
                    batch = %report.batch_id,
                    invalid = report.warnings.invalid_events.len(),
                    failed = report.warnings.failed_statements.len(),
                    "Materialization warnings"
                );
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, logging out");
    client.logout().await.ok();
    reporter.abort();
    Ok(())
}
