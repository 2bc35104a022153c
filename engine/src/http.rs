//! REST surface under `/v1`.
//!
//! Thin request/response layer over the service facade. Handlers validate
//! shape, map engine error kinds to status codes, and honor per-request
//! deadlines from the `x-timeout-ms` header. Mutating operations run on a
//! detached task so a lapsed deadline abandons the wait without aborting a
//! critical section mid-persist.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use crate::embedding::EmbeddingClient;
use crate::error::{EngineError, Result};
use crate::metrics;
use crate::service::{ChunkPatch, DocumentPatch, LibraryPatch, NewChunk, VectorDbService};

/// Shared server state. The service slot is filled once recovery finishes;
/// until then every `/v1` operation answers 503.
pub struct AppState {
    service: OnceCell<Arc<VectorDbService>>,
    embedder: Option<Arc<EmbeddingClient>>,
}

impl AppState {
    pub fn new(embedder: Option<Arc<EmbeddingClient>>) -> Arc<Self> {
        Arc::new(Self {
            service: OnceCell::new(),
            embedder,
        })
    }

    /// Flip to serving. Called exactly once, after recovery.
    pub fn set_service(&self, service: Arc<VectorDbService>) {
        let _ = self.service.set(service);
    }

    pub fn ready(&self) -> bool {
        self.service.get().is_some()
    }

    fn service(&self) -> Result<Arc<VectorDbService>> {
        self.service
            .get()
            .cloned()
            .ok_or_else(|| EngineError::Unavailable("recovery in progress".into()))
    }

    fn embedder(&self) -> Result<Arc<EmbeddingClient>> {
        self.embedder
            .clone()
            .ok_or_else(|| EngineError::Upstream("embedding service is not configured".into()))
    }
}

/// Engine error as an HTTP response with a stable kind tag.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::State(_) | EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::Upstream(_) => StatusCode::BAD_GATEWAY,
            EngineError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Cancelled(_) => StatusCode::GATEWAY_TIMEOUT,
        };
        let body = json!({ "error": self.0.kind(), "message": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn deadline(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("x-timeout-ms")?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_millis)
}

/// Read path: cancellation while waiting on a lock leaves the queue cleanly.
async fn run_read<T>(headers: &HeaderMap, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match deadline(headers) {
        None => fut.await,
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| EngineError::Cancelled("deadline exceeded".into()))?,
    }
}

/// Write path: the operation itself always runs to completion (rollback
/// included); only the response wait is bounded by the deadline.
async fn run_write<T: Send + 'static>(
    headers: &HeaderMap,
    fut: impl Future<Output = Result<T>> + Send + 'static,
) -> Result<T> {
    match deadline(headers) {
        None => fut.await,
        Some(limit) => {
            let task = tokio::spawn(fut);
            match tokio::time::timeout(limit, task).await {
                Ok(joined) => {
                    joined.map_err(|e| EngineError::Upstream(format!("operation task: {e}")))?
                }
                Err(_) => Err(EngineError::Cancelled("deadline exceeded".into())),
            }
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/libraries", post(create_library).get(list_libraries))
        .route(
            "/v1/libraries/:id",
            get(get_library).patch(update_library).delete(delete_library),
        )
        .route(
            "/v1/libraries/:id/documents",
            post(create_document).get(list_documents),
        )
        .route(
            "/v1/libraries/:id/documents/:did",
            get(get_document)
                .patch(update_document)
                .delete(delete_document),
        )
        .route(
            "/v1/libraries/:id/chunks",
            post(create_chunk).get(list_chunks).delete(delete_all_chunks),
        )
        .route("/v1/libraries/:id/chunks/batch", post(create_chunks_batch))
        .route(
            "/v1/libraries/:id/chunks/:cid",
            get(get_chunk).patch(update_chunk).delete(delete_chunk),
        )
        .route("/v1/libraries/:id/search", post(search))
        .route("/v1/libraries/:id/index/train", post(train_index))
        .route("/v1/libraries/:id/index/rebuild", post(rebuild_index))
        .route("/v1/libraries/:id/stats", get(stats))
        .route("/v1/embed", post(embed))
        .route("/metrics", get(metrics_text))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Deserialize)]
struct CreateLibraryRequest {
    name: String,
    dims: usize,
    index_type: String,
    index_params: Option<serde_json::Value>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
struct CreateDocumentRequest {
    title: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
struct BatchChunksRequest {
    chunks: Vec<NewChunk>,
}

fn default_k() -> usize {
    10
}

#[derive(Deserialize)]
struct SearchRequest {
    embedding: Vec<f32>,
    #[serde(default = "default_k")]
    k: usize,
    #[serde(default)]
    include_chunk: bool,
}

#[derive(Deserialize, Default)]
struct TrainRequest {
    sample_vectors: Option<Vec<Vec<f32>>>,
}

#[derive(Deserialize)]
struct EmbedRequest {
    text: Option<String>,
    texts: Option<Vec<String>>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn metrics_text() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

async fn create_library(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateLibraryRequest>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service()?;
    let library = run_write(&headers, async move {
        service
            .create_library(
                body.name,
                body.dims,
                &body.index_type,
                body.index_params.as_ref(),
                body.metadata,
            )
            .await
    })
    .await?;
    Ok((StatusCode::CREATED, Json(library)))
}

async fn list_libraries(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let service = state.service()?;
    let libraries = run_read(&headers, async { Ok(service.list_libraries().await) }).await?;
    Ok(Json(libraries))
}

async fn get_library(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service()?;
    let library = run_read(&headers, service.get_library(&id)).await?;
    Ok(Json(library))
}

async fn update_library(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<LibraryPatch>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service()?;
    let library =
        run_write(&headers, async move { service.update_library(&id, patch).await }).await?;
    Ok(Json(library))
}

async fn delete_library(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service()?;
    run_write(&headers, async move { service.delete_library(&id).await }).await?;
    Ok(Json(json!({ "deleted": true })))
}

async fn create_document(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<CreateDocumentRequest>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service()?;
    let document = run_write(&headers, async move {
        service.create_document(&id, body.title, body.metadata).await
    })
    .await?;
    Ok((StatusCode::CREATED, Json(document)))
}

async fn list_documents(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service()?;
    let documents = run_read(&headers, service.list_documents(&id)).await?;
    Ok(Json(documents))
}

async fn get_document(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, did)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service()?;
    let document = run_read(&headers, service.get_document(&id, &did)).await?;
    Ok(Json(document))
}

async fn update_document(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, did)): Path<(String, String)>,
    Json(patch): Json<DocumentPatch>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service()?;
    let document = run_write(&headers, async move {
        service.update_document(&id, &did, patch).await
    })
    .await?;
    Ok(Json(document))
}

async fn delete_document(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, did)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service()?;
    run_write(&headers, async move { service.delete_document(&id, &did).await }).await?;
    Ok(Json(json!({ "deleted": true })))
}

async fn create_chunk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<NewChunk>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service()?;
    let chunk = run_write(&headers, async move { service.create_chunk(&id, body).await }).await?;
    Ok((StatusCode::CREATED, Json(chunk)))
}

async fn create_chunks_batch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<BatchChunksRequest>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service()?;
    let chunks = run_write(&headers, async move {
        service.create_chunks_batch(&id, body.chunks).await
    })
    .await?;
    Ok((StatusCode::CREATED, Json(chunks)))
}

async fn list_chunks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service()?;
    let chunks = run_read(&headers, service.list_chunks(&id)).await?;
    Ok(Json(chunks))
}

async fn get_chunk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, cid)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service()?;
    let chunk = run_read(&headers, service.get_chunk(&id, &cid)).await?;
    Ok(Json(chunk))
}

async fn update_chunk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, cid)): Path<(String, String)>,
    Json(patch): Json<ChunkPatch>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service()?;
    let chunk = run_write(&headers, async move {
        service.update_chunk(&id, &cid, patch).await
    })
    .await?;
    Ok(Json(chunk))
}

async fn delete_chunk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, cid)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service()?;
    run_write(&headers, async move { service.delete_chunk(&id, &cid).await }).await?;
    Ok(Json(json!({ "deleted": true })))
}

async fn delete_all_chunks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service()?;
    let n = run_write(&headers, async move { service.delete_all_chunks(&id).await }).await?;
    Ok(Json(json!({ "deleted": n })))
}

async fn search(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<SearchRequest>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service()?;
    let results = run_read(
        &headers,
        service.search(&id, &body.embedding, body.k, body.include_chunk),
    )
    .await?;
    Ok(Json(results))
}

async fn train_index(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<TrainRequest>>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service()?;
    let samples = body.and_then(|Json(b)| b.sample_vectors);
    run_write(&headers, async move { service.train_index(&id, samples).await }).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "trained": true }))))
}

async fn rebuild_index(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service()?;
    run_write(&headers, async move { service.rebuild_index(&id).await }).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "rebuilt": true }))))
}

async fn stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let service = state.service()?;
    let stats = run_read(&headers, service.stats(&id)).await?;
    Ok(Json(stats))
}

/// Text to vector. This endpoint never touches a library lock.
async fn embed(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EmbedRequest>,
) -> ApiResult<impl IntoResponse> {
    let embedder = state.embedder()?;
    match (body.text, body.texts) {
        (Some(text), None) => {
            let embedding = embedder.embed_one(&text).await?;
            Ok(Json(json!({ "embedding": embedding })))
        }
        (None, Some(texts)) => {
            let embeddings = embedder.embed_many(&texts).await?;
            Ok(Json(json!({ "embeddings": embeddings })))
        }
        _ => Err(EngineError::Validation(
            "provide exactly one of 'text' or 'texts'".into(),
        )
        .into()),
    }
}
