use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use session_exec::SessionManager;
use std::{net::SocketAddr, sync::Arc};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// Upper bound on submitted code, in bytes.
pub const MAX_CODE_LEN: usize = 10_000;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Server error: {0}")]
    ServerError(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ServerError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, self.to_string()),
            ServerError::ServerError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ExecuteRequest {
    pub code: String,
    pub id: Option<String>,
}

/// Exactly one of `error` vs (`stdout` | `stderr`) is populated; unused
/// fields are serialized as `null`. Empty captures are `null`, not `""`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub id: String,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    manager: Arc<SessionManager>,
}

pub fn create_app(manager: Arc<SessionManager>) -> Router {
    let state = AppState { manager };

    let cors = CorsLayer::permissive();

    Router::new()
        .route("/health", get(health_check))
        .route("/execute", post(execute))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve until ctrl-c. Callers tear the session manager down afterwards.
pub async fn run_server(app: Router, addr: SocketAddr) -> Result<(), ServerError> {
    info!("Starting session execution server on {}", addr);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::ServerError(e.to_string()))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ServerError::ServerError(e.to_string()))?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}

async fn health_check() -> &'static str {
    "OK"
}

async fn execute(
    State(state): State<AppState>,
    Json(payload): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ServerError> {
    if payload.code.is_empty() {
        return Err(ServerError::Validation("code must be non-empty".to_string()));
    }
    if payload.code.len() > MAX_CODE_LEN {
        return Err(ServerError::Validation(format!(
            "code exceeds {MAX_CODE_LEN} bytes"
        )));
    }

    let outcome = state
        .manager
        .execute(payload.id.as_deref(), &payload.code)
        .await;

    Ok(Json(ExecuteResponse {
        id: outcome.id,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        error: outcome.error.map(|kind| kind.as_str().to_string()),
    }))
}
