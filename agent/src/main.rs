mod handlers;
mod monitor;
mod state;

use crate::state::AppState;
use anyhow::{Context, Result};
use std::{env, time::Duration};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_BIND: &str = "0.0.0.0:8090";
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_RETENTION_SECS: u64 = 600;

fn env_secs(key: &str, default: u64) -> Duration {
    let secs = env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG pisa el filtro por defecto
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("agent=debug,bjasync=debug,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let bind = env::var("AGENT_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let sweep_interval = env_secs("AGENT_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS);
    let retention = env_secs("AGENT_RETENTION_SECS", DEFAULT_RETENTION_SECS);

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let state = AppState::new(hostname, retention);

    // router HTTP
    let app = handlers::build_router(state.clone());

    // monitor de pilots en segundo plano
    let monitor_state = state.clone();
    tokio::spawn(async move {
        monitor::monitor_pilots(monitor_state, sweep_interval).await;
    });

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", bind))?;
    info!(
        "agent escuchando en {} (barrido cada {:?}, retención {:?})",
        listener.local_addr()?,
        sweep_interval,
        retention
    );

    axum::serve(listener, app).await?;
    Ok(())
}
