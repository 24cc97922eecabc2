//! HTTP API served on the HTTP sub-listener

mod task_logs;

pub use task_logs::TaskLogBackend;

use std::io;
use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use serde::{Deserialize, Serialize};
use serde_json::json;

use cm_core::config::MasterConfig;
use cm_core::store::TaskLog;
use cm_core::{ExperimentId, StoreError};

use crate::error::SupervisionError;
use crate::logs::{LogEntry, LogQuery};
use crate::state::MasterState;
use crate::supervision::{ExperimentMessage, ExperimentStatus, Supervisor};
use crate::transport::SubListener;

/// Errors returned by API handlers
#[derive(Debug)]
pub enum ApiError {
    /// Recovery has not finished
    NotReady,
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotReady => (
                StatusCode::SERVICE_UNAVAILABLE,
                "master is recovering".to_string(),
            ),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::Conflict(message) => (StatusCode::CONFLICT, message),
            Self::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<SupervisionError> for ApiError {
    fn from(e: SupervisionError) -> Self {
        match e {
            SupervisionError::NotFound(_) => Self::NotFound(e.to_string()),
            SupervisionError::MailboxClosed(_) => Self::Conflict(e.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Internal(e.to_string())
    }
}

/// Response body of `GET /info`
#[derive(Debug, Serialize)]
pub struct MasterInfo {
    pub version: &'static str,
    pub cluster_id: String,
    pub cluster_name: String,
    pub master_id: String,
    pub port: u16,
    pub ready: bool,
}

/// Query string of `GET /logs`
#[derive(Debug, Default, Deserialize)]
pub struct LogsParams {
    pub less_than_id: Option<u64>,
    pub greater_than_id: Option<u64>,
    pub tail: Option<usize>,
}

/// Build the API router
pub fn router(state: Arc<MasterState>) -> Router {
    let gated = Router::new()
        .route("/experiments/:id/kill", post(kill_experiment))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_ready,
        ));

    Router::new()
        .route("/info", get(info))
        .route("/config", get(config))
        .route("/health", get(health))
        .route("/logs", get(master_logs))
        .route("/experiments", get(list_experiments))
        .route("/task-logs", post(add_task_logs))
        .merge(gated)
        .with_state(state)
}

/// Serve `router` on every connection the HTTP sub-listener yields
///
/// Returns when the sub-listener fails or closes.
pub async fn serve(listener: SubListener, router: Router) -> io::Result<()> {
    tracing::info!("HTTP server accepting connections");

    loop {
        let stream = listener.accept().await?;
        let peer = stream.peer_addr();
        let service = TowerToHyperService::new(router.clone());

        tokio::spawn(async move {
            let builder = auto::Builder::new(TokioExecutor::new());
            if let Err(e) = builder
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!("HTTP connection from {} ended: {}", peer, e);
            }
        });
    }
}

async fn require_ready(
    State(state): State<Arc<MasterState>>,
    request: Request,
    next: Next,
) -> Response {
    if !state.is_ready() {
        return ApiError::NotReady.into_response();
    }
    next.run(request).await
}

async fn info(State(state): State<Arc<MasterState>>) -> Json<MasterInfo> {
    Json(MasterInfo {
        version: env!("CARGO_PKG_VERSION"),
        cluster_id: state.cluster_id.clone(),
        cluster_name: state.config.cluster_name.clone(),
        master_id: state.master_id.to_string(),
        port: state.config.port,
        ready: state.is_ready(),
    })
}

async fn config(State(state): State<Arc<MasterState>>) -> Json<MasterConfig> {
    Json(state.config.clone())
}

async fn health(State(state): State<Arc<MasterState>>) -> (StatusCode, Json<serde_json::Value>) {
    if state.is_ready() {
        (StatusCode::OK, Json(json!({ "status": "ok" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "recovering" })),
        )
    }
}

async fn master_logs(
    State(state): State<Arc<MasterState>>,
    Query(params): Query<LogsParams>,
) -> Json<Vec<LogEntry>> {
    Json(state.logs.entries(LogQuery {
        greater_than_id: params.greater_than_id,
        less_than_id: params.less_than_id,
        tail: params.tail,
    }))
}

async fn list_experiments(State(state): State<Arc<MasterState>>) -> Json<Vec<ExperimentStatus>> {
    Json(state.experiments.statuses().await)
}

async fn kill_experiment(
    State(state): State<Arc<MasterState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state
        .experiments
        .send(ExperimentId(id), ExperimentMessage::Kill)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn add_task_logs(
    State(state): State<Arc<MasterState>>,
    Json(logs): Json<Vec<TaskLog>>,
) -> Result<StatusCode, ApiError> {
    state.task_logs.add_task_logs(logs).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AllocationRegistry;
    use crate::supervision::{AgentDirectory, ExperimentRegistry};
    use axum::body::Body;
    use cm_core::store::ExperimentRecord;
    use cm_core::{ClusterStore, SnapshotStore};
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> (Arc<MasterState>, Arc<SnapshotStore>) {
        let store = Arc::new(SnapshotStore::in_memory());
        let dyn_store: Arc<dyn ClusterStore> = Arc::clone(&store) as Arc<dyn ClusterStore>;
        let allocations = Arc::new(AllocationRegistry::new());
        let experiments = Arc::new(ExperimentRegistry::new(
            Arc::clone(&dyn_store),
            Arc::clone(&allocations),
            AgentDirectory::new(),
            Duration::from_secs(5),
        ));
        let state = Arc::new(MasterState::new(
            MasterConfig::default(),
            "cluster-1".to_string(),
            dyn_store,
            experiments,
            allocations,
        ));
        (state, store)
    }

    fn request(method: &str, uri: &str, body: Body) -> Request {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_tracks_readiness() {
        let (state, _) = state();
        let app = router(Arc::clone(&state));

        let response = app
            .clone()
            .oneshot(request("GET", "/health", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.mark_ready();
        let response = app
            .oneshot(request("GET", "/health", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_kill_is_gated_until_ready() {
        let (state, _) = state();
        let app = router(Arc::clone(&state));

        let response = app
            .clone()
            .oneshot(request("POST", "/experiments/1/kill", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.mark_ready();
        let response = app
            .oneshot(request("POST", "/experiments/1/kill", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_kill_running_experiment() {
        let (state, store) = state();
        let record = ExperimentRecord::active(ExperimentId(3), json!({}));
        store.put_experiment(record.clone()).await.unwrap();
        state.experiments.restore(record).await.unwrap();
        state.mark_ready();

        let response = router(Arc::clone(&state))
            .oneshot(request("POST", "/experiments/3/kill", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_task_logs_are_stored() {
        let (state, store) = state();
        let body = json!([{ "task_id": "t1", "timestamp": null, "log": "epoch 1" }]);

        let response = router(state)
            .oneshot(request("POST", "/task-logs", Body::from(body.to_string())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(store.task_logs().len(), 1);
    }

    #[tokio::test]
    async fn test_master_logs_window() {
        let (state, _) = state();
        for i in 0..6 {
            state.logs.push("INFO", "cm_master", format!("line {}", i));
        }

        let response = router(Arc::clone(&state))
            .oneshot(request("GET", "/logs?greater_than_id=1&tail=2", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let entries: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let ids: Vec<_> = entries
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![4, 5]);

        let response = router(state)
            .oneshot(request("GET", "/logs?less_than_id=0", Body::empty()))
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"[]");
    }

    #[tokio::test]
    async fn test_info_reports_identity() {
        let (state, _) = state();
        let response = router(state)
            .oneshot(request("GET", "/info", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let info: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(info["cluster_id"], "cluster-1");
        assert_eq!(info["ready"], false);
    }
}
