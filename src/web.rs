use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use log::{info, warn};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::dump::StatsDocument;
use crate::errors::{Result, StatsError};
use crate::handle::StatsHandle;
use crate::resolver::parse_snapshot;
use crate::types::TableStats;

pub type SharedHandle = Arc<StatsHandle>;

/// Error body `{"error": "..."}` with a status derived from the error kind.
pub struct ApiError(StatsError);

impl From<StatsError> for ApiError {
    fn from(e: StatsError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            StatsError::InvalidSnapshot(_) | StatsError::EncodingError(_) | StatsError::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            StatsError::TableNotFound(_) => StatusCode::NOT_FOUND,
            StatsError::SafePointViolation { .. } | StatsError::SnapshotTooOld { .. } => {
                StatusCode::GONE
            }
            StatsError::SchemaMismatch(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("status api: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub fn router(handle: SharedHandle) -> Router {
    Router::new()
        .route("/stats/dump/:db/:table", get(dump_current))
        .route("/stats/dump/:db/:table/:snapshot", get(dump_historical))
        .route("/stats/load", post(load))
        .layer(CorsLayer::permissive())
        .with_state(handle)
}

/// Serves the status API on `port` until `shutdown` resolves.
pub async fn start_server<F>(handle: SharedHandle, port: u16, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("status api listening on {}", listener.local_addr()?);
    axum::serve(listener, router(handle))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("status api stopped");
    Ok(())
}

/// GET /stats/dump/:db/:table
async fn dump_current(
    State(handle): State<SharedHandle>,
    Path((db, table)): Path<(String, String)>,
) -> std::result::Result<Json<Option<StatsDocument>>, ApiError> {
    Ok(Json(handle.dump_stats(&db, &table)?))
}

/// GET /stats/dump/:db/:table/:snapshot
async fn dump_historical(
    State(handle): State<SharedHandle>,
    Path((db, table, snapshot)): Path<(String, String, String)>,
) -> std::result::Result<Json<Option<StatsDocument>>, ApiError> {
    let at = parse_snapshot(&snapshot)?;
    Ok(Json(handle.dump_stats_at(&db, &table, &at)?))
}

/// POST /stats/load
async fn load(
    State(handle): State<SharedHandle>,
    body: Bytes,
) -> std::result::Result<Json<TableStats>, ApiError> {
    let raw = std::str::from_utf8(&body).map_err(|e| StatsError::encoding(e.to_string()))?;
    let doc = StatsDocument::from_json(raw)?;
    Ok(Json(handle.load_stats(&doc).await?))
}
