//! HTTP server.
//!
//! Exposes the engine as a JSON HTTP API. Long operations report progress
//! to every `GET /progress` subscriber as server-sent events.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Version, row/source counts, table state, held locks |
//! | `GET`  | `/catalog` | Catalog snapshot `{files, collections}` |
//! | `POST` | `/sources` | Ingest `{sources: [...]}` |
//! | `POST` | `/sources/remove` | Remove `{source}` |
//! | `POST` | `/sources/reindex` | Reindex `{source}` |
//! | `POST` | `/rebuild` | Rebuild `{mode: "full" \| "incremental"}` |
//! | `POST` | `/search` | Search `{query, k?, sources?, collection?}` |
//! | `POST` | `/collections` | Create `{name, files}` |
//! | `PATCH` | `/collections/{id}` | Rename / set files |
//! | `DELETE` | `/collections/{id}` | Delete with exclusive members |
//! | `POST` | `/lock/release` | Force-release `{lock_id?}` |
//! | `GET`  | `/progress` | Progress stream (SSE) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "not found: collection 42" } }
//! ```
//!
//! `code` is the [`ErrorKind`] of the failure.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::{Any, CorsLayer};

use kbase_core::catalog::CollectionPatch;
use kbase_core::error::ErrorKind;
use kbase_core::models::SearchHit;

use crate::catalog::CatalogSnapshot;
use crate::engine::{EngineStatus, IngestReport, KnowledgeBase};
use crate::lock::GLOBAL_LOCK;
use crate::progress::BroadcastProgress;
use crate::rebuild::{RebuildMode, RebuildReport};
use crate::retrieval::SearchOptions;

#[derive(Clone)]
struct AppState {
    kb: Arc<KnowledgeBase>,
    progress: BroadcastProgress,
}

/// Build the router for `kb`.
pub fn router(kb: Arc<KnowledgeBase>) -> Router {
    let state = AppState {
        kb,
        progress: BroadcastProgress::new(256),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/catalog", get(handle_catalog))
        .route("/sources", post(handle_ingest))
        .route("/sources/remove", post(handle_remove))
        .route("/sources/reindex", post(handle_reindex))
        .route("/rebuild", post(handle_rebuild))
        .route("/search", post(handle_search))
        .route("/collections", post(handle_create_collection))
        .route(
            "/collections/{id}",
            patch(handle_update_collection).delete(handle_delete_collection),
        )
        .route("/lock/release", post(handle_lock_release))
        .route("/progress", get(handle_progress))
        .layer(cors)
        .with_state(state)
}

/// Serve `kb` on `[server].bind` until the process is terminated.
pub async fn run_server(kb: Arc<KnowledgeBase>) -> anyhow::Result<()> {
    let bind_addr = kb.config().server.bind.clone();
    let app = router(kb);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening");
    eprintln!("kbase server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let kind = ErrorKind::of(&err);
        let status = match kind {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::SchemaMismatch | ErrorKind::LockReleased => StatusCode::CONFLICT,
            ErrorKind::Unreachable | ErrorKind::PartialFailure => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::ProviderUnavailable | ErrorKind::LockTimeout => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %format!("{:#}", err), "request failed");
        }
        AppError {
            status,
            code: kind.as_str(),
            message: format!("{:#}", err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: ErrorKind::InvalidInput.as_str(),
        message: message.into(),
    }
}

type ApiResult<T> = Result<Json<T>, AppError>;

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    engine: EngineStatus,
}

async fn handle_health(State(state): State<AppState>) -> ApiResult<HealthResponse> {
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        engine: state.kb.status().await?,
    }))
}

// ============ catalog & sources ============

async fn handle_catalog(State(state): State<AppState>) -> ApiResult<CatalogSnapshot> {
    Ok(Json(state.kb.snapshot().await?))
}

#[derive(Deserialize)]
struct IngestRequest {
    sources: Vec<String>,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> ApiResult<IngestReport> {
    if req.sources.is_empty() {
        return Err(bad_request("sources must not be empty"));
    }
    let report = state
        .kb
        .ingest_sources(&req.sources, &state.progress)
        .await?
        .into_result()?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct SourceRequest {
    source: String,
}

async fn handle_remove(
    State(state): State<AppState>,
    Json(req): Json<SourceRequest>,
) -> ApiResult<CatalogSnapshot> {
    Ok(Json(state.kb.remove_source(&req.source).await?))
}

async fn handle_reindex(
    State(state): State<AppState>,
    Json(req): Json<SourceRequest>,
) -> ApiResult<CatalogSnapshot> {
    Ok(Json(
        state
            .kb
            .reindex_source(&req.source, &state.progress)
            .await?,
    ))
}

#[derive(Deserialize, Default)]
struct RebuildRequest {
    #[serde(default)]
    mode: RebuildMode,
}

async fn handle_rebuild(
    State(state): State<AppState>,
    body: Option<Json<RebuildRequest>>,
) -> ApiResult<RebuildReport> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(state.kb.rebuild(req.mode, &state.progress).await?))
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(flatten)]
    options: SearchOptions,
    #[serde(default)]
    collection: Option<String>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchHit>,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> ApiResult<SearchResponse> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let results = match req.collection {
        Some(id) => {
            state
                .kb
                .search_collection(&req.query, &id, req.options.k)
                .await?
        }
        None => state.kb.search(&req.query, req.options).await?,
    };
    Ok(Json(SearchResponse { results }))
}

// ============ collections ============

#[derive(Deserialize)]
struct CreateCollectionRequest {
    name: String,
    #[serde(default)]
    files: Vec<String>,
}

async fn handle_create_collection(
    State(state): State<AppState>,
    Json(req): Json<CreateCollectionRequest>,
) -> ApiResult<CatalogSnapshot> {
    Ok(Json(
        state.kb.create_collection(&req.name, &req.files).await?,
    ))
}

async fn handle_update_collection(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<CollectionPatch>,
) -> ApiResult<CatalogSnapshot> {
    Ok(Json(state.kb.update_collection(&id, patch).await?))
}

async fn handle_delete_collection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<CatalogSnapshot> {
    Ok(Json(
        state.kb.delete_collection(&id, &state.progress).await?,
    ))
}

// ============ POST /lock/release ============

#[derive(Deserialize, Default)]
struct LockReleaseRequest {
    #[serde(default)]
    lock_id: Option<String>,
}

#[derive(Serialize)]
struct LockReleaseResponse {
    lock_id: String,
    released: bool,
}

async fn handle_lock_release(
    State(state): State<AppState>,
    body: Option<Json<LockReleaseRequest>>,
) -> Json<LockReleaseResponse> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let lock_id = req.lock_id.unwrap_or_else(|| GLOBAL_LOCK.to_string());
    let released = state.kb.lock().force_release(&lock_id);
    Json(LockReleaseResponse { lock_id, released })
}

// ============ GET /progress ============

async fn handle_progress(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.progress.subscribe()).filter_map(|msg| {
        // Lagged receivers skip what they missed.
        let msg = msg.ok()?;
        Event::default().event("progress").json_data(&msg).ok().map(Ok)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[test]
    fn errors_map_to_statuses() {
        let err: anyhow::Error = kbase_core::error::KbError::NotFound("x".into()).into();
        let app: AppError = err.into();
        assert_eq!(app.status, StatusCode::NOT_FOUND);
        assert_eq!(app.code, "not_found");

        let err = anyhow::anyhow!("boom");
        let app: AppError = err.into();
        assert_eq!(app.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn catalog_route_returns_empty_document() {
        let config = crate::config::Config::with_db_path("unused.sqlite");
        let kb = Arc::new(KnowledgeBase::builder(config).build().unwrap());
        let response = router(kb)
            .oneshot(Request::builder().uri("/catalog").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_collection_is_404() {
        let config = crate::config::Config::with_db_path("unused.sqlite");
        let kb = Arc::new(KnowledgeBase::builder(config).build().unwrap());
        let response = router(kb)
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/collections/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
