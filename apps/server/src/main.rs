//! Entry point for the sync server binary: loads config from the
//! environment, wires up [`AppState`], and serves the REST surface from §6
//! behind `tower-http`'s trace/compression/cors layers.

mod auth;
mod error;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use auth::{AuthProvider, StaticTokenAuthProvider};
use opsync_sync_server::ServerSyncService;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("starting opsync-server");

    let base_dir = std::env::var("OPSYNC_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let quota_bytes: i64 = std::env::var("OPSYNC_QUOTA_BYTES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(opsync_sync_server::DEFAULT_QUOTA_BYTES);

    let sync = Arc::new(ServerSyncService::new(base_dir).with_quota_bytes(quota_bytes));
    let auth: Arc<dyn AuthProvider> = Arc::new(load_auth_provider());
    let state = AppState::new(sync, auth);

    let app = Router::new()
        .merge(routes::sync_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app).await?;

    Ok(())
}

/// `OPSYNC_STATIC_TOKENS` is a `token=user_id` list, comma-separated.
/// Intended for tests and single-tenant deployments; a real issuer sits in
/// front of this in production and is out of scope here.
fn load_auth_provider() -> StaticTokenAuthProvider {
    let entries = std::env::var("OPSYNC_STATIC_TOKENS").unwrap_or_default();
    let tokens = entries.split(',').filter_map(|pair| {
        let (token, user_id) = pair.split_once('=')?;
        Some((token.to_string(), user_id.to_string()))
    });
    StaticTokenAuthProvider::new(tokens)
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("opsync_server=info,tower_http=info"));

    fmt().with_env_filter(env_filter).init();
}
