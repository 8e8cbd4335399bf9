//! HTTP surface for collaborators and peer nodes.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Extension, Json, Path, Query},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::distributed::PEER_ID_HEADER;
use crate::error::EngineError;
use crate::gateway::{DeliveryGateway, PutRequest};
use crate::storage::StorageError;
use crate::sync::{ChangeSet, SyncEngine, SyncError};
use crate::types::ReachLevel;

/// Identity of the caller on collaborator requests
pub const IDENTITY_HEADER: &str = "x-identity";
pub const REACH_HEADER: &str = "x-reach";
pub const BENEFICIARY_HEADER: &str = "x-beneficiary";
/// Comma-separated invited identities
pub const INVITED_HEADER: &str = "x-invited";

const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;
const DEFAULT_PAGE: usize = 50;

pub struct AppState {
    pub gateway: Arc<DeliveryGateway>,
    pub sync: Arc<SyncEngine>,
}

/// Error response; gate failures never carry a reason
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError(err.into())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::Forbidden | EngineError::KeyUnavailable => StatusCode::FORBIDDEN,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InsufficientShards { .. }
            | EngineError::CorruptShard { .. }
            | EngineError::NetworkTimeout(_) => StatusCode::BAD_GATEWAY,
            EngineError::PolicyConflict(_) => StatusCode::CONFLICT,
            EngineError::InsufficientStorage { .. } => StatusCode::INSUFFICIENT_STORAGE,
            EngineError::InvalidRequest(_)
            | EngineError::Storage(StorageError::InvalidKey(_))
            | EngineError::Sync(SyncError::InvalidChange(_)) => StatusCode::BAD_REQUEST,
            EngineError::Storage(StorageError::KeyNotFound(_)) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self.0 {
            EngineError::Forbidden => "forbidden".to_string(),
            other => other.to_string(),
        };
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            debug!("Request rejected ({}): {}", status, self.0);
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn invalid(message: impl Into<String>) -> ApiError {
    ApiError(EngineError::InvalidRequest(message.into()))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/blob", put(put_blob))
        .route("/blob/:digest", get(get_blob).delete(delete_blob))
        .route(
            "/shard/:digest",
            get(get_shard)
                .head(head_shard)
                .put(put_shard)
                .delete(release_shard),
        )
        .route("/manifest/:digest", get(get_manifest))
        .route("/health", get(health))
        .route("/docs/:app_id", get(list_docs))
        .route("/docs/:app_id/:doc_id", get(doc_info).delete(delete_doc))
        .route("/docs/:app_id/:doc_id/heads", get(doc_heads))
        .route(
            "/docs/:app_id/:doc_id/changes",
            get(doc_changes).post(apply_doc_changes),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}

async fn put_blob(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let owner = header_value(&headers, IDENTITY_HEADER)
        .ok_or_else(|| invalid("x-identity header is required"))?;
    let reach = match header_value(&headers, REACH_HEADER) {
        Some(raw) => raw
            .parse::<ReachLevel>()
            .map_err(|e| invalid(e.to_string()))?,
        None => ReachLevel::Private,
    };
    let invited: BTreeSet<String> = header_value(&headers, INVITED_HEADER)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let mut request = PutRequest::new(body.to_vec(), reach, owner).with_invited(invited);
    if let Some(mime) = header_value(&headers, header::CONTENT_TYPE.as_str()) {
        request = request.with_mime_type(mime);
    }
    if let Some(beneficiary) = header_value(&headers, BENEFICIARY_HEADER) {
        request = request.with_beneficiary(beneficiary);
    }

    let manifest = state.gateway.put(request).await?;
    Ok((StatusCode::CREATED, Json(manifest)).into_response())
}

async fn get_blob(
    Extension(state): Extension<Arc<AppState>>,
    Path(digest): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let requester = header_value(&headers, IDENTITY_HEADER);
    let blob = state.gateway.serve(&digest, requester).await?;
    Ok(([(header::CONTENT_TYPE, blob.mime_type)], blob.bytes).into_response())
}

async fn delete_blob(
    Extension(state): Extension<Arc<AppState>>,
    Path(digest): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let requester = header_value(&headers, IDENTITY_HEADER);
    state.gateway.delete(&digest, requester).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn head_shard(
    Extension(state): Extension<Arc<AppState>>,
    Path(digest): Path<String>,
) -> ApiResult<StatusCode> {
    if state.gateway.head_shard(&digest).await? {
        Ok(StatusCode::OK)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

async fn get_shard(
    Extension(state): Extension<Arc<AppState>>,
    Path(digest): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let peer = header_value(&headers, PEER_ID_HEADER);
    let bytes = state.gateway.shard_bytes(&digest, peer).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}

async fn put_shard(
    Extension(state): Extension<Arc<AppState>>,
    Path(digest): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let peer = header_value(&headers, PEER_ID_HEADER);
    state.gateway.accept_shard(&digest, &body, peer).await?;
    Ok(StatusCode::CREATED)
}

async fn release_shard(
    Extension(state): Extension<Arc<AppState>>,
    Path(digest): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let peer = header_value(&headers, PEER_ID_HEADER);
    state.gateway.release_shard(&digest, peer).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_manifest(
    Extension(state): Extension<Arc<AppState>>,
    Path(digest): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let requester = header_value(&headers, IDENTITY_HEADER);
    let manifest = state.gateway.manifest(&digest, requester).await?;
    Ok(Json(manifest).into_response())
}

async fn health(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    Json(state.gateway.health().await)
}

/// Document traffic comes from collaborators and peer nodes alike; only the
/// node-level gate applies.
fn check_doc_access(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let caller = header_value(headers, IDENTITY_HEADER).or_else(|| header_value(headers, PEER_ID_HEADER));
    if state.gateway.sovereignty().should_serve_at_all(caller) {
        Ok(())
    } else {
        Err(ApiError(EngineError::Forbidden))
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    offset: Option<usize>,
    limit: Option<usize>,
}

async fn list_docs(
    Extension(state): Extension<Arc<AppState>>,
    Path(app_id): Path<String>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    check_doc_access(&state, &headers)?;
    let (documents, total) = state
        .sync
        .list(
            &app_id,
            query.offset.unwrap_or(0),
            query.limit.unwrap_or(DEFAULT_PAGE),
        )
        .await?;
    Ok(Json(json!({ "documents": documents, "total": total })).into_response())
}

async fn doc_info(
    Extension(state): Extension<Arc<AppState>>,
    Path((app_id, doc_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    check_doc_access(&state, &headers)?;
    let info = state.sync.info(&app_id, &doc_id).await?;
    Ok(Json(info).into_response())
}

async fn delete_doc(
    Extension(state): Extension<Arc<AppState>>,
    Path((app_id, doc_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    check_doc_access(&state, &headers)?;
    state.sync.delete(&app_id, &doc_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn doc_heads(
    Extension(state): Extension<Arc<AppState>>,
    Path((app_id, doc_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    check_doc_access(&state, &headers)?;
    let heads = state.sync.heads(&app_id, &doc_id).await?;
    Ok(Json(json!({ "heads": heads })).into_response())
}

#[derive(Debug, Deserialize)]
struct ChangesQuery {
    have: Option<String>,
}

async fn doc_changes(
    Extension(state): Extension<Arc<AppState>>,
    Path((app_id, doc_id)): Path<(String, String)>,
    Query(query): Query<ChangesQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    check_doc_access(&state, &headers)?;
    let have: Vec<String> = query
        .have
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect();
    let changes = state.sync.changes_since(&app_id, &doc_id, &have).await?;
    Ok(Json(changes).into_response())
}

async fn apply_doc_changes(
    Extension(state): Extension<Arc<AppState>>,
    Path((app_id, doc_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(changes): Json<ChangeSet>,
) -> ApiResult<Response> {
    check_doc_access(&state, &headers)?;
    let heads = state.sync.apply_changes(&app_id, &doc_id, &changes).await?;
    Ok(Json(json!({ "heads": heads })).into_response())
}
