//! HTTP trigger surface: liveness on `GET /`, a full sync run on `POST /`.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use crmsync_sync::SyncService;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "crmsync-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SyncService>,
}

impl AppState {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self { service }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_handler).post(sync_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening for sync triggers");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "CRM sync API is up"
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    let report = state.service.run_once().await;
    match report.first_failure() {
        None => {
            info!(run_id = %report.run_id, "triggered sync completed");
            (StatusCode::OK, "Sync completed.").into_response()
        }
        Some(failure) => {
            error!(run_id = %report.run_id, error = %failure, "triggered sync failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Sync failed.").into_response()
        }
    }
}
