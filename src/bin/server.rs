//! hive-server：HTTP 控制面入口（--features server）

use std::sync::Arc;

use anyhow::Context;

use hive::config::load_config;
use hive::core::{spawn_control_plane, Orchestrator};
use hive::server::{serve, ServerState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("config load failed ({e}), using defaults");
        hive::config::AppConfig::default()
    });
    let bind = cfg.server.bind.clone();
    let auth_token = cfg.server.auth_token.clone();

    let orchestrator = Arc::new(Orchestrator::build(cfg).context("failed to build control plane")?);
    let recovered = orchestrator
        .recover_runs()
        .context("crash recovery failed")?;
    if !recovered.is_empty() {
        tracing::info!("rolled back {} stranded run(s)", recovered.len());
    }

    let task_tx = spawn_control_plane(orchestrator.clone(), 4);
    let state = Arc::new(ServerState {
        orchestrator,
        task_tx,
        auth_token,
    });

    serve(&bind, state).await
}
