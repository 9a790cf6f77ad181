//! Tally server library logic.
//!
//! Owns the process-level surface around the persistence core: the router
//! business handlers mount on and the health endpoint that reports the
//! state of the write-back.

pub mod config;

use axum::{routing::get, Extension, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tally_db::Store;
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The booted store.
    pub store: Arc<Store>,
}

/// Health check handler.
///
/// Returns `200 OK` with server status, version and write-back state.
/// Background flush failures show up in `flushFailures` and
/// `lastFlushError`; the status stays `ok`.
async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let stats = state.store.write_back_stats();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "flushPending": state.store.is_flush_pending(),
        "flushFailures": stats.failures,
        "lastFlushError": stats.last_error,
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
