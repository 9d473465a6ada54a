//! Route table (§6): wires every submission-surface endpoint plus the node
//! WebSocket upgrade onto one axum `Router`.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::app::SharedState;

use super::handlers;
use super::ws;

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/ws", get(ws::upgrade))
        .route("/api/jobs", get(handlers::list_jobs).post(handlers::create_job))
        .route("/api/jobs/:id", get(handlers::get_job))
        .route("/api/jobs/:id/status", post(handlers::update_job_status))
        .route("/api/jobs/:id/force-fail", post(handlers::force_fail_job))
        .route("/api/jobs/:id/logs", get(handlers::list_job_logs))
        .route("/api/nodes", get(handlers::list_nodes))
        .route("/api/config", get(handlers::get_config).post(handlers::post_config))
        .route("/api/broadcast", post(handlers::broadcast))
        .route("/api/send", post(handlers::send))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
