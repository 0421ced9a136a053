//! Beiwe data pipeline -- batch job submission and execution tracking.
//!
//! This crate provides credential rotation for batch users, job submission to
//! a compute backend, a persistent execution lifecycle, a frequency scheduler
//! and the HTTP API in front of them.

pub mod api;
pub mod backend;
pub mod directory;
pub mod pipeline;
pub mod scheduler;
pub mod settings;
pub mod storage;
pub mod tracking;

use anyhow::{Context, Result};

use crate::pipeline::config::ConfigResolver;
use crate::pipeline::Pipeline;
use crate::settings::AppSettings;

/// Start the daemon: API server and frequency scheduler.
pub async fn serve(settings: AppSettings) -> Result<()> {
    // 1. Initialize Storage
    let db_path = settings.storage.db_path.to_string_lossy().into_owned();
    tracing::info!(%db_path, "Initializing database");
    let pool = storage::open_pool(&db_path)?;

    // 2. Remote clients. The blocking HTTP client must not be built on a
    //    runtime worker.
    let backend_settings = settings.backend.clone();
    let backends = tokio::task::spawn_blocking(move || backend::connect(&backend_settings))
        .await
        .context("backend setup task failed")??;
    let pipeline = Pipeline::new(pool, backends);
    let resolver = ConfigResolver::new(settings.pipeline.object_names_path.clone());

    // 3. Start Scheduler Engine (background task)
    let scheduler = scheduler::Scheduler::new(&settings.schedule.frequencies)?;
    let state = api::state::AppState::new(pipeline.clone(), resolver);
    let scheduler_resolver = state.resolver.clone();
    tokio::spawn(async move {
        scheduler::run_scheduler_loop(scheduler, pipeline, scheduler_resolver).await;
    });

    // 4. Start API Server
    let addr: std::net::SocketAddr = settings
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", settings.server.bind))?;
    let app = api::router(state);

    tracing::info!(%addr, "beiwe-pipeline listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
