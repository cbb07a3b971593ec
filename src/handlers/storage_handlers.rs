//! REST handlers for storage operations.
//!
//! Request bodies are streamed straight into the dispatcher and object
//! downloads are streamed back out, so nothing is buffered in memory.

use crate::{
    errors::AppError,
    handlers::AppState,
    models::{checksum::Checksum, identity::Identity, metadata::MetaData},
    services::storage::{CommitOutcome, ObjectReader},
};
use axum::{
    Json,
    body::Body,
    extract::{FromRequestParts, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io;
use tokio_util::io::{ReaderStream, StreamReader};

/// Trusted header carrying the authenticated user name.
pub const USER_HEADER: &str = "x-clawio-user";
/// `algorithm:value` checksum token.
pub const CHECKSUM_HEADER: &str = "checksum";
/// Marks a PUT whose path is a chunk key.
pub const OC_CHUNKED_HEADER: &str = "oc-chunked";
/// Offset inside the chunk at which the body starts.
pub const CHUNK_START_HEADER: &str = "x-chunk-start";

const CONTENT_MD5_HEADER: &str = "content-md5";

#[derive(Debug, Deserialize)]
pub struct StatQuery {
    #[serde(default)]
    pub children: bool,
}

#[derive(Debug, Deserialize)]
pub struct RecursiveQuery {
    #[serde(default)]
    pub recursive: bool,
}

/// Body of `POST /api/v1/copy` and `POST /api/v1/rename`.
#[derive(Debug, Deserialize)]
pub struct TransferReq {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Serialize)]
struct StartChunkedResp {
    transfer_id: String,
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let username = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::unauthorized("missing X-Clawio-User header"))?;

        let identity = Identity::new(username);
        if !identity.has_valid_namespace() {
            return Err(AppError::unauthorized("invalid user name"));
        }
        Ok(identity)
    }
}

/// `POST /api/v1/home` - make sure the caller has a home on every backend.
pub async fn create_home(
    State(state): State<AppState>,
    identity: Identity,
) -> Result<StatusCode, AppError> {
    state.dispatcher.provision_homes(&identity).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/v1/capabilities/{*path}`
pub async fn get_capabilities(
    State(state): State<AppState>,
    identity: Identity,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    let caps = state.dispatcher.capabilities(&identity, &path).await?;
    Ok(Json(caps).into_response())
}

/// `GET /api/v1/meta` - the synthetic root listing every backend.
pub async fn stat_root(
    State(state): State<AppState>,
    identity: Identity,
    Query(q): Query<StatQuery>,
) -> Result<Json<MetaData>, AppError> {
    let md = state
        .dispatcher
        .dispatch_stat(&identity, "/", q.children)
        .await?;
    Ok(Json(md))
}

/// `GET /api/v1/meta/{*path}?children=true`
pub async fn stat_resource(
    State(state): State<AppState>,
    identity: Identity,
    Path(path): Path<String>,
    Query(q): Query<StatQuery>,
) -> Result<Json<MetaData>, AppError> {
    let md = state
        .dispatcher
        .dispatch_stat(&identity, &path, q.children)
        .await?;
    Ok(Json(md))
}

/// `PUT /api/v1/objects/{*path}`
///
/// A plain PUT replaces the object atomically. With `OC-Chunked: 1` the path
/// is a chunk key: the chunk is staged and a commit is attempted right away.
pub async fn upload_object(
    State(state): State<AppState>,
    identity: Identity,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let chunked = headers
        .get(OC_CHUNKED_HEADER)
        .is_some_and(|v| v.as_bytes() == b"1");
    let size = content_length(&headers)?;
    let checksum = checksum_from_headers(&headers, chunked)?;
    let reader = body_reader(body);

    if !chunked {
        state
            .dispatcher
            .dispatch_put_object(&identity, &path, reader, size, &checksum)
            .await?;
        let md = state.dispatcher.dispatch_stat(&identity, &path, false).await?;
        return Ok(metadata_response(StatusCode::OK, md));
    }

    let start = match headers.get(CHUNK_START_HEADER) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| AppError::bad_request("invalid X-Chunk-Start header"))?,
        None => 0,
    };
    state
        .dispatcher
        .dispatch_put_chunked_object(&identity, reader, size, start, &path)
        .await?;

    let outcome = state
        .dispatcher
        .dispatch_commit_chunked_upload(&identity, &path, &checksum)
        .await?;
    Ok(match outcome {
        CommitOutcome::Committed(md) => metadata_response(StatusCode::OK, md),
        CommitOutcome::Pending { received, total } => (
            StatusCode::CREATED,
            Json(json!({ "status": "pending", "received": received, "total": total })),
        )
            .into_response(),
        CommitOutcome::Busy => {
            (StatusCode::CREATED, Json(json!({ "status": "busy" }))).into_response()
        }
    })
}

/// `GET /api/v1/objects/{*path}` as a streaming response.
pub async fn download_object(
    State(state): State<AppState>,
    identity: Identity,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    let md = state.dispatcher.dispatch_stat(&identity, &path, false).await?;
    let reader = state.dispatcher.dispatch_get_object(&identity, &path).await?;
    let body = Body::from_stream(ReaderStream::new(reader));

    let mut response = Response::new(body);
    // The object may be replaced between stat and open, so no Content-Length.
    set_metadata_headers(response.headers_mut(), &md, false);
    Ok(response)
}

/// `HEAD /api/v1/objects/{*path}` - same headers as GET but no body.
pub async fn head_object(
    State(state): State<AppState>,
    identity: Identity,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    let md = state.dispatcher.dispatch_stat(&identity, &path, false).await?;
    let mut response = Response::new(Body::empty());
    set_metadata_headers(response.headers_mut(), &md, true);
    Ok(response)
}

/// `DELETE /api/v1/objects/{*path}?recursive=true`
pub async fn delete_object(
    State(state): State<AppState>,
    identity: Identity,
    Path(path): Path<String>,
    Query(q): Query<RecursiveQuery>,
) -> Result<StatusCode, AppError> {
    state
        .dispatcher
        .dispatch_remove(&identity, &path, q.recursive)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/v1/containers/{*path}?recursive=true`
pub async fn create_container(
    State(state): State<AppState>,
    identity: Identity,
    Path(path): Path<String>,
    Query(q): Query<RecursiveQuery>,
) -> Result<StatusCode, AppError> {
    state
        .dispatcher
        .dispatch_create_container(&identity, &path, q.recursive)
        .await?;
    Ok(StatusCode::CREATED)
}

/// `POST /api/v1/chunked/{*path}` - open a chunked upload for `path`.
pub async fn start_chunked_upload(
    State(state): State<AppState>,
    identity: Identity,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    let transfer_id = state
        .dispatcher
        .dispatch_start_chunked_upload(&identity, &path)
        .await?;
    Ok((StatusCode::CREATED, Json(StartChunkedResp { transfer_id })).into_response())
}

/// `POST /api/v1/copy`
pub async fn copy_resource(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<TransferReq>,
) -> Result<StatusCode, AppError> {
    state
        .dispatcher
        .dispatch_copy(&identity, &req.from, &req.to)
        .await?;
    Ok(StatusCode::CREATED)
}

/// `POST /api/v1/rename`
pub async fn rename_resource(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<TransferReq>,
) -> Result<StatusCode, AppError> {
    state
        .dispatcher
        .dispatch_rename(&identity, &req.from, &req.to)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

fn body_reader(body: Body) -> ObjectReader {
    let stream = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));
    Box::new(StreamReader::new(stream))
}

fn content_length(headers: &HeaderMap) -> Result<u64, AppError> {
    let value = headers
        .get(header::CONTENT_LENGTH)
        .ok_or_else(|| AppError::new(StatusCode::LENGTH_REQUIRED, "Content-Length is required"))?;
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| AppError::bad_request("invalid Content-Length header"))
}

/// `Checksum: alg:value` wins; otherwise `Content-MD5` (base64 digest).
///
/// On a chunk PUT, `Content-MD5` covers only that chunk's body, so only the
/// `Checksum` header is taken as the whole-object checksum.
fn checksum_from_headers(headers: &HeaderMap, chunked: bool) -> Result<Checksum, AppError> {
    if let Some(value) = headers.get(CHECKSUM_HEADER) {
        let token = value
            .to_str()
            .map_err(|_| AppError::bad_request("invalid Checksum header"))?;
        return Ok(token.parse().unwrap_or_default());
    }
    if let Some(value) = headers.get(CONTENT_MD5_HEADER).filter(|_| !chunked) {
        let digest = value
            .to_str()
            .ok()
            .and_then(|v| general_purpose::STANDARD.decode(v.trim()).ok())
            .filter(|bytes| bytes.len() == 16)
            .ok_or_else(|| AppError::bad_request("invalid Content-MD5 header"))?;
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        return Ok(Checksum::new("md5", hex));
    }
    Ok(Checksum::none())
}

fn metadata_response(status: StatusCode, md: MetaData) -> Response {
    let mut headers = HeaderMap::new();
    set_metadata_headers(&mut headers, &md, false);
    headers.remove(header::CONTENT_TYPE);
    (status, headers, Json(md)).into_response()
}

fn set_metadata_headers(headers: &mut HeaderMap, md: &MetaData, with_length: bool) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&md.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    if with_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(md.size));
    }

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", md.etag)) {
        headers.insert(header::ETAG, value);
    }

    if let Ok(value) = HeaderValue::from_str(&md.modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }

    if !md.checksum.is_empty() {
        let token = format!("{}:{}", md.checksum_type, md.checksum);
        if let Ok(value) = HeaderValue::from_str(&token) {
            headers.insert(CHECKSUM_HEADER, value);
        }
    }
}
