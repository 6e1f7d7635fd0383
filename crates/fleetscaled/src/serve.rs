//! The serve command: run the reconciler pool and the metrics server
//! until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tracing::info;

use fleetscale_core::{Reconciler, ReconcilerPool, ReconcilerStats};

use crate::config::Config;

pub async fn run(config: Config) -> Result<()> {
    config.validate()?;

    let platform = config
        .new_platform_client()
        .context("cannot create platform client")?;
    let client_factory = config
        .new_fleet_api_factory()
        .context("cannot create fleet api client factory")?;
    let collectors = config
        .new_metric_collectors()
        .context("cannot create metrics collectors")?;
    info!(n = collectors.len(), "metric collectors initialized");

    let bounds = config.bounds();
    let regions = config.regions.clone();
    let initial_state = config.initial_state();
    let process_group = config.process_group.clone();

    let mut pool = ReconcilerPool::new(platform, config.concurrency);
    pool.app_name = config.app_name.clone();
    pool.org_slug = config.org.clone();
    pool.reconcile_interval = config.interval()?;
    pool.reconcile_timeout = config.timeout()?;
    pool.app_list_refresh_interval = config.app_list_refresh_interval()?;
    pool.client_factory = Some(client_factory);
    pool.reconciler_factory = Some(Box::new(move || {
        let mut reconciler = Reconciler::new();
        reconciler.bounds = bounds.clone();
        reconciler.collectors = collectors.clone();
        reconciler.regions = regions.clone();
        reconciler.initial_state = initial_state.clone();
        reconciler.process_group = process_group.clone();
        reconciler
    }));

    info!(
        app = %config.app_name,
        interval = %config.interval,
        timeout = %config.timeout,
        app_list_refresh_interval = %config.app_list_refresh_interval,
        min_created = %config.min_created_expr(),
        max_created = %config.max_created_expr(),
        min_started = %config.min_started_expr(),
        max_started = %config.max_started_expr(),
        "reconciler pool initialized, beginning loop"
    );

    let stats = pool.stats();
    let handle = pool.open().await.context("cannot open reconciler pool")?;

    serve_metrics(&config.metrics_addr, stats).await?;

    info!("signal received, shutting down");
    handle.close().await;
    Ok(())
}

/// Serve `/metrics` and `/healthz` until ctrl-c.
async fn serve_metrics(addr: &str, stats: Arc<ReconcilerStats>) -> Result<()> {
    let router = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(stats);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind metrics listener on {addr}"))?;
    info!(%addr, "serving metrics");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("metrics server")
}

async fn metrics_handler(State(stats): State<Arc<ReconcilerStats>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        stats.render_prometheus(),
    )
}
