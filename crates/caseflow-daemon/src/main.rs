//! caseflow-daemon entry point.
//!
//! Sets up tracing, loads configuration, builds the shared state, wires
//! middleware, and starts the HTTP server. Route handlers live in
//! `routes.rs`; shared state types in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use caseflow_daemon::{bootstrap, routes, state};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let paths = bootstrap::config_paths_from_env();
    let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    let loaded = caseflow_config::load_layered_yaml(&refs)
        .with_context(|| format!("load config layers {paths:?}"))?;

    let shared = Arc::new(bootstrap::state_from_config(&loaded).await?);

    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(1));
    state::spawn_notice_relay(shared.coordinator.notifications(), shared.bus.clone());
    let _feed = shared.coordinator.start_change_feed();

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8898)));
    info!("caseflow-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("CASEFLOW_DAEMON_ADDR").ok()?.parse().ok()
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler; run until killed.
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
