//! Tempo AI daemon — AI orchestration for the Tempo time tracker.
//!
//! Listens on a Unix socket for JSON-RPC requests from the application's
//! request handlers. Owns the encrypted credential vault, the provider
//! clients with fallback, the feature gates, the shared cache and the
//! analytic engines.
//!
//! Security:
//! - Provider keys encrypted at rest (AES-256-GCM + PBKDF2-HMAC-SHA256)
//! - Master key via TEMPO_AI_MASTER_KEY (32 bytes minimum)
//! - Socket with 0600 permissions, local-only
//! - Keys never cross the socket boundary

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use tempo_ai::orchestrator::Orchestrator;
use tempo_ai::server::Server;
use tempo_ai::AiConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tempo_ai=info".into()),
        )
        .with_target(false)
        .init();

    info!("Tempo AI orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let cfg = AiConfig::from_env();
    std::fs::create_dir_all(&cfg.data_dir)?;

    if cfg.master_encryption_key.len() < 32 {
        anyhow::bail!(
            "TEMPO_AI_MASTER_KEY must be set to at least 32 bytes; \
             credential encryption cannot operate without it"
        );
    }

    let socket_path = cfg.socket_path.clone();
    let orchestrator =
        Arc::new(Orchestrator::open(cfg).context("Failed to initialize orchestrator")?);

    let credentials = orchestrator.credentials_list(None, true)?;
    match credentials["total"].as_u64().unwrap_or(0) {
        0 => info!("No provider credentials configured — AI features report unavailable"),
        n => info!("{n} active provider credential(s) loaded"),
    }

    let server = Server::new(socket_path, orchestrator);
    info!("Orchestrator ready");
    server.run().await
}
