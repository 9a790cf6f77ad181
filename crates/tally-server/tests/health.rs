use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tally_db::{Store, StoreConfig};
use tally_server::{app, AppState};
use tempfile::TempDir;
use tower::ServiceExt; // for oneshot

async fn get_health(state: AppState) -> Value {
    let response = app(state)
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn health_check_reports_idle_write_back() {
    let dir = TempDir::new().unwrap();
    let store = Store::initialize(StoreConfig::file(dir.path().join("tally.db")))
        .await
        .unwrap();

    let json = get_health(AppState {
        store: Arc::new(store),
    })
    .await;

    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(json["flushPending"], false);
    assert_eq!(json["flushFailures"], 0);
    assert!(json["lastFlushError"].is_null());
}

#[tokio::test]
async fn health_check_reports_pending_flush() {
    let dir = TempDir::new().unwrap();
    let config =
        StoreConfig::file(dir.path().join("tally.db")).with_flush_delay(Duration::from_secs(60));
    let store = Arc::new(Store::initialize(config).await.unwrap());

    store
        .execute("INSERT INTO settings (key, value) VALUES ('locale', 'de-CH');")
        .unwrap();

    let json = get_health(AppState {
        store: Arc::clone(&store),
    })
    .await;
    assert_eq!(json["flushPending"], true);

    store.close().unwrap();
    assert!(!store.is_flush_pending());
}
