use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use dashmap::DashMap;
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use super::ws;
use crate::config::ServerConfig;
use crate::error::{SyncError, SyncResult};
use crate::storage::{StateRecord, StateStore};
use crate::sync::{BroadcastHub, DeliveryReport, FetchResponse, PushEvent, ReplaceResponse};

const MAX_DOMAIN_LEN: usize = 128;

#[derive(Clone)]
pub struct AppState {
    pub store: StateStore,
    pub hub: Arc<BroadcastHub>,
    pub config: Arc<ServerConfig>,
    started: Instant,
    // Same-domain replaces run one at a time so broadcasts follow commit order
    write_locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> SyncResult<Self> {
        let store = StateStore::open(&config.data_dir)?;
        let hub = BroadcastHub::new(config.subscriber_buffer);

        Ok(Self {
            store,
            hub,
            config: Arc::new(config),
            started: Instant::now(),
            write_locks: Arc::new(DashMap::new()),
        })
    }

    /// Durably replace `domain`'s state, then notify subscribers
    ///
    /// Nothing is published unless the write committed.
    pub async fn replace(
        &self,
        domain: &str,
        payload: Value,
    ) -> SyncResult<(Arc<StateRecord>, DeliveryReport)> {
        let lock = self
            .write_locks
            .entry(domain.to_string())
            .or_default()
            .clone();
        let guard = lock.lock().await;

        let record = match self.store.write(domain, payload).await {
            Ok(record) => record,
            Err(err) => {
                drop(guard);
                drop(lock);
                // Only committed domains keep a lock entry
                self.write_locks
                    .remove_if(domain, |_, lock| Arc::strong_count(lock) == 1);
                return Err(err);
            }
        };
        let report = self.hub.publish(PushEvent::StateUpdate {
            domain: record.domain.clone(),
            data: record.payload.clone(),
            timestamp: Some(record.updated_at),
        });

        Ok((record, report))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.body_limit_bytes;

    Router::new()
        .route("/", get(|| async { "State Sync Server" }))
        .route("/api/health", get(health))
        .route("/api/{domain}/state", get(get_state).post(put_state))
        .route("/ws", get(ws_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws::handle_ws(state, socket))
}

async fn get_state(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<Json<FetchResponse>, SyncError> {
    validate_domain(&domain)?;

    let response = match state.store.read(&domain).await {
        Ok(Some(record)) => FetchResponse {
            success: true,
            state: Some(record.payload.clone()),
            last_updated: Some(record.updated_at),
            message: None,
        },
        Ok(None) => FetchResponse {
            success: true,
            state: None,
            last_updated: None,
            message: Some("No saved state found".to_string()),
        },
        Err(err) => {
            error!(domain = %domain, "Failed to read state: {err}");
            return Err(err);
        }
    };

    Ok(Json(response))
}

async fn put_state(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    body: Bytes,
) -> Result<Json<ReplaceResponse>, SyncError> {
    validate_domain(&domain)?;
    let payload: Value = serde_json::from_slice(&body)?;

    let (record, report) = state.replace(&domain, payload).await.map_err(|err| {
        error!(domain = %domain, "Failed to save state: {err}");
        err
    })?;

    info!(
        domain = %domain,
        delivered = report.delivered,
        dropped = report.dropped,
        "Saved state"
    );

    Ok(Json(ReplaceResponse {
        success: true,
        message: Some(format!("{domain} state saved successfully")),
        timestamp: Some(record.updated_at),
    }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let domains = state.store.domains().await.map(|d| d.len()).unwrap_or(0);

    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_secs": state.uptime_secs(),
        "clients": state.hub.len(),
        "domains": domains,
        "config": {
            "data_dir": state.config.data_dir.display().to_string(),
            "body_limit_bytes": state.config.body_limit_bytes,
            "subscriber_buffer": state.config.subscriber_buffer,
        },
    }))
}

fn validate_domain(domain: &str) -> SyncResult<()> {
    if domain.is_empty() {
        return Err(SyncError::InvalidDomain("domain is empty".to_string()));
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(SyncError::InvalidDomain(format!(
            "domain longer than {MAX_DOMAIN_LEN} bytes"
        )));
    }
    if domain.chars().any(char::is_control) {
        return Err(SyncError::InvalidDomain(
            "domain contains control characters".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_state() -> (TempDir, AppState) {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            data_dir: dir.path().join("data"),
            ..ServerConfig::default()
        };
        (dir, AppState::new(config).unwrap())
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_without_saved_state() {
        let (_dir, state) = test_state();
        let response = router(state)
            .oneshot(
                Request::get("/api/quantum/state")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert!(body["state"].is_null());
    }

    #[tokio::test]
    async fn test_replace_then_fetch() {
        let (_dir, state) = test_state();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/quantum/state")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"level":0.5}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["success"], true);

        let response = app
            .oneshot(
                Request::get("/api/quantum/state")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["state"], json!({"level": 0.5}));
        assert!(body["lastUpdated"].is_string());
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected_without_publish() {
        let (_dir, state) = test_state();
        let mut sub = state.hub.subscribe();
        let store = state.store.clone();

        let response = router(state)
            .oneshot(
                Request::post("/api/quantum/state")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["success"], false);
        assert!(store.read("quantum").await.unwrap().is_none());
        assert!(tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_failed_write_does_not_publish() {
        let (_dir, state) = test_state();
        let mut sub = state.hub.subscribe();
        std::fs::remove_dir_all(state.store.dir()).unwrap();

        let err = state.replace("quantum", json!({"level": 1})).await.unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Durability);
        assert!(state.write_locks.is_empty());
        assert!(tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv())
            .await
            .is_err());

        let response = router(state)
            .oneshot(
                Request::post("/api/quantum/state")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_each_commit_publishes_once() {
        let (_dir, state) = test_state();
        let mut sub = state.hub.subscribe();

        state.replace("quantum", json!({"v": 1})).await.unwrap();
        state.replace("quantum", json!({"v": 2})).await.unwrap();

        for expected in [1, 2] {
            match &*sub.recv().await.unwrap() {
                PushEvent::StateUpdate { data, .. } => assert_eq!(data["v"], expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv())
            .await
            .is_err());
        assert_eq!(
            state.store.read("quantum").await.unwrap().unwrap().payload,
            json!({"v": 2})
        );
    }

    #[tokio::test]
    async fn test_long_multibyte_domain_over_http() {
        let (_dir, state) = test_state();
        let app = router(state);
        let domain = "量".repeat(42);
        assert!(validate_domain(&domain).is_ok());
        let uri = format!(
            "/api/{}/state",
            url::form_urlencoded::byte_serialize(domain.as_bytes()).collect::<String>()
        );

        let response = app
            .clone()
            .oneshot(Request::get(uri.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert!(body["state"].is_null());

        let response = app
            .clone()
            .oneshot(
                Request::post(uri.as_str())
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"level":0.5}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get(uri.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await["state"], json!({"level": 0.5}));
    }

    #[tokio::test]
    async fn test_health_reports_clients() {
        let (_dir, state) = test_state();
        let _sub = state.hub.subscribe();

        let response = router(state)
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["clients"], 1);
    }

    #[test]
    fn test_validate_domain() {
        assert!(validate_domain("quantum").is_ok());
        assert!(validate_domain("").is_err());
        assert!(validate_domain(&"x".repeat(MAX_DOMAIN_LEN + 1)).is_err());
        assert!(validate_domain("bad\nname").is_err());
    }
}
