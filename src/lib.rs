//! lisorch -- distributed test orchestration for Linux Integration Services
//! test suites.
//!
//! Dispatches setup and workload commands to test hosts over SSH, waits on
//! per-host state markers, reduces workload logs into metrics, and folds
//! sub-test verdicts into one terminal run state.

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod marker;
pub mod metrics;
pub mod orchestrator;
pub mod outcome;
pub mod poller;
pub mod remote;
pub mod state;
pub mod storage;

use std::path::Path;

use anyhow::{Context, Result};

/// Serve run history over HTTP.
pub async fn serve(bind: &str, db_path: &Path) -> Result<()> {
    tracing::info!(db_path = %db_path.display(), "Initializing database");
    let pool = storage::open_pool(db_path)?;

    let addr: std::net::SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address {}", bind))?;
    let app = api::router(api::state::AppState { pool });

    tracing::info!(%addr, "lisorch API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
