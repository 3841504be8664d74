//! Escalation server
//!
//! Serves the escalation engine over HTTP: alert triggers, acknowledgments,
//! asynchronous dispatch-result callbacks and chain/method administration.
//!
//! # Usage
//!
//! ```bash
//! # Seeded store, real webhook delivery
//! escalation-server --seed chains.json --config escalation.toml
//!
//! # Log every notification instead of sending it
//! ESCALATION_DRY_RUN=1 escalation-server --seed chains.json
//! ```

mod routes;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use coordination::chain::DeliveryMethodType;
use coordination::dispatch::webhook::DEFAULT_WEBHOOK_TIMEOUT;
use coordination::{
    EngineConfig, EscalationCoordinator, LogDispatcher, MemoryStore, MethodRouter,
    SharedDispatcher, WebhookDispatcher,
};
use tracing::info;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "ESCALATION_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// TOML engine configuration (defaults come from ESCALATION_* variables)
    #[arg(long, env = "ESCALATION_CONFIG")]
    config: Option<PathBuf>,

    /// JSON seed file with delivery methods and chains
    #[arg(long, env = "ESCALATION_SEED")]
    seed: Option<PathBuf>,

    /// Log notifications instead of delivering them
    #[arg(long, env = "ESCALATION_DRY_RUN", default_value_t = false)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match &args.config {
        Some(path) => EngineConfig::from_toml_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let store = match &args.seed {
        Some(path) => MemoryStore::load_json(path)
            .with_context(|| format!("loading seed {}", path.display()))?,
        None => MemoryStore::new(),
    }
    .shared();

    let dispatcher = build_dispatcher(args.dry_run)?;
    let coordinator = EscalationCoordinator::start(store.clone(), store, dispatcher, config);

    let app = routes::router(coordinator.clone());
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    info!(bind = %args.bind, dry_run = args.dry_run, "Escalation server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    coordinator.shutdown().await;
    Ok(())
}

/// Webhook-style methods go out over HTTP; everything else is logged
fn build_dispatcher(dry_run: bool) -> Result<SharedDispatcher> {
    let log: SharedDispatcher = Arc::new(LogDispatcher::new());
    if dry_run {
        return Ok(log);
    }

    let webhook: SharedDispatcher = Arc::new(
        WebhookDispatcher::new(DEFAULT_WEBHOOK_TIMEOUT).context("building webhook client")?,
    );
    let router = MethodRouter::new()
        .route(DeliveryMethodType::Webhook, webhook.clone())
        .route(DeliveryMethodType::Slack, webhook)
        .fallback(log);
    info!(?router, "Dispatch routes configured");
    let router: SharedDispatcher = router.shared();
    Ok(router)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
