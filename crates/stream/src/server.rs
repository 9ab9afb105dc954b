//! HTTP surface for the durable streams protocol.
//!
//! One wildcard route carries the whole method matrix: `PUT` creates,
//! `HEAD` observes, `POST` appends, `GET` reads (catch-up, long-poll,
//! or SSE), `DELETE` tears down.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderName, Method, StatusCode},
    response::{IntoResponse, Response, Sse},
    routing::get,
    Router,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::time::timeout;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
};
use tracing::info;

use crate::{
    cursor::CursorConfig,
    error::{code, ApiError},
    ledger::ProducerClaim,
    maintenance,
    offset::{format_offset, Offset},
    persist::Persister,
    sse::{self, SseParams},
    store::{StoreError, StreamEventKind, StreamStore},
    types::{normalize_path, ServerOptions, StreamConfig, StreamMeta},
};

/// Protocol header names.
pub mod headers {
    use axum::http::HeaderName;

    pub const STREAM_NEXT_OFFSET: HeaderName = HeaderName::from_static("stream-next-offset");
    pub const STREAM_UP_TO_DATE: HeaderName = HeaderName::from_static("stream-up-to-date");
    pub const STREAM_CURSOR: HeaderName = HeaderName::from_static("stream-cursor");
    pub const STREAM_TTL: HeaderName = HeaderName::from_static("stream-ttl");
    pub const STREAM_EXPIRES_AT: HeaderName = HeaderName::from_static("stream-expires-at");
    pub const STREAM_SEQ: HeaderName = HeaderName::from_static("stream-seq");
    pub const PRODUCER_ID: HeaderName = HeaderName::from_static("producer-id");
    pub const PRODUCER_EPOCH: HeaderName = HeaderName::from_static("producer-epoch");
    pub const PRODUCER_SEQ: HeaderName = HeaderName::from_static("producer-seq");
    pub const PRODUCER_EXPECTED_SEQ: HeaderName =
        HeaderName::from_static("producer-expected-seq");
    pub const PRODUCER_RECEIVED_SEQ: HeaderName =
        HeaderName::from_static("producer-received-seq");
    pub const STREAM_RESPONSE_ID: HeaderName = HeaderName::from_static("stream-response-id");
    pub const UPSTREAM_STATUS: HeaderName = HeaderName::from_static("upstream-status");
    pub const UPSTREAM_CONTENT_TYPE: HeaderName =
        HeaderName::from_static("upstream-content-type");
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StreamStore>,
    pub options: Arc<ServerOptions>,
}

impl AppState {
    fn cursor_config(&self) -> CursorConfig {
        CursorConfig {
            interval_seconds: self.options.cursor_interval_seconds,
            epoch: self.options.cursor_epoch,
        }
    }
}

/// Query parameters for GET requests.
#[derive(Debug, Deserialize)]
pub struct ReadQuery {
    pub offset: Option<String>,
    pub live: Option<String>,
    pub cursor: Option<String>,
}

/// Create the router with all stream endpoints.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .expose_headers([
            headers::STREAM_NEXT_OFFSET,
            headers::STREAM_UP_TO_DATE,
            headers::STREAM_CURSOR,
            headers::STREAM_RESPONSE_ID,
            headers::UPSTREAM_STATUS,
            headers::UPSTREAM_CONTENT_TYPE,
        ]);

    let body_limit = state.options.max_append_bytes + 1024;
    let compression = state.options.compression;

    let mut router = Router::new()
        .route("/", get(handle_root))
        .route(
            "/{*path}",
            axum::routing::put(handle_create)
                .head(handle_head)
                .get(handle_read)
                .post(handle_append)
                .delete(handle_delete)
                .options(handle_preflight),
        )
        .layer(cors)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state);

    if compression {
        router = router.layer(CompressionLayer::new());
    }
    router
}

/// GET / - server identity and stream count.
async fn handle_root(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(json!({
        "server": "durable-stream",
        "streams": state.store.len(),
    }))
}

/// OPTIONS - CORS surface for non-preflight callers.
async fn handle_preflight() -> Response {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(
            "access-control-allow-methods",
            "GET, HEAD, POST, PUT, DELETE, PATCH",
        )
        .header(
            "access-control-allow-headers",
            "Content-Type, Stream-TTL, Stream-Expires-At, Stream-Seq, Producer-Id, \
             Producer-Epoch, Producer-Seq, Stream-Signed-URL-TTL, Upstream-Url, \
             Upstream-Method, Upstream-Header-Authorization",
        )
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::NO_CONTENT.into_response())
}

/// PUT - create (or confirm) a stream.
async fn handle_create(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers_in: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let path = normalize_path(&path);

    let content_type = header_string(&headers_in, &header::CONTENT_TYPE);
    let ttl_seconds = parse_ttl(&headers_in)?;
    let expires_at = parse_expires_at(&headers_in)?;
    check_body_size(&state, &body)?;

    let config = StreamConfig {
        content_type: content_type.clone(),
        ttl_seconds,
        expires_at,
        initial_data: if body.is_empty() { None } else { Some(body) },
    };

    let outcome = state.store.create(&path, config)?;

    let mut response = Response::builder()
        .status(if outcome.created {
            StatusCode::CREATED
        } else {
            StatusCode::OK
        })
        .header(headers::STREAM_NEXT_OFFSET, format_offset(outcome.next_offset))
        .header(header::LOCATION, &path);
    if let Some(ct) = content_type {
        response = response.header(header::CONTENT_TYPE, ct);
    }
    Ok(response
        .body(Body::empty())
        .map_err(|e| ApiError::internal(e.to_string()))?)
}

/// HEAD - stream metadata.
async fn handle_head(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Result<Response, ApiError> {
    let path = normalize_path(&path);
    let meta = state.store.head(&path).ok_or_else(|| ApiError::not_found(&path))?;

    let cursor = state.cursor_config().next_cursor(query.cursor.as_deref());
    let start = query.offset.as_deref().unwrap_or("-1");
    let etag = generate_etag(&path, start, &format_offset(meta.next_offset));

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(headers::STREAM_NEXT_OFFSET, format_offset(meta.next_offset))
        .header(headers::STREAM_CURSOR, cursor)
        .header(header::ETAG, etag);
    if let Some(ct) = &meta.content_type {
        response = response.header(header::CONTENT_TYPE, ct.as_str());
    }
    if let Some(ttl) = meta.ttl_seconds {
        response = response.header(headers::STREAM_TTL, ttl.to_string());
    }
    if let Some(expires) = meta.expires_at {
        response = response.header(headers::STREAM_EXPIRES_AT, expires.to_rfc3339());
    }
    response
        .body(Body::empty())
        .map_err(|e| ApiError::internal(e.to_string()))
}

/// GET - read from a stream (catch-up, long-poll, or SSE).
async fn handle_read(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Result<Response, ApiError> {
    read_stream(&state, normalize_path(&path), query).await
}

/// Read dispatch shared by the core route and the proxy profile.
pub(crate) async fn read_stream(
    state: &AppState,
    path: String,
    query: ReadQuery,
) -> Result<Response, ApiError> {
    let meta = state.store.head(&path).ok_or_else(|| ApiError::not_found(&path))?;

    let raw_offset = query.offset.as_deref().unwrap_or("-1");
    let offset = Offset::parse(raw_offset).ok_or_else(|| {
        ApiError::bad_request(code::INVALID_OFFSET, format!("invalid offset: {}", raw_offset))
    })?;

    let cursor = state.cursor_config().next_cursor(query.cursor.as_deref());

    match query.live.as_deref() {
        None => handle_catch_up(state, &path, &offset, &cursor, &meta),
        Some("long-poll") => handle_long_poll(state.clone(), path, offset, cursor, meta).await,
        Some("sse") => handle_sse(state, path, &offset, query.cursor, &meta),
        Some(other) => Err(ApiError::bad_request(
            code::BAD_REQUEST,
            format!("invalid live mode: {}", other),
        )),
    }
}

/// Immediate catch-up read.
fn handle_catch_up(
    state: &AppState,
    path: &str,
    offset: &Offset,
    cursor: &str,
    meta: &StreamMeta,
) -> Result<Response, ApiError> {
    let result = state.store.read(path, offset)?;
    let start = result.next_offset - result.bytes.len() as u64;
    let etag = generate_etag(path, &format_offset(start), &format_offset(result.next_offset));
    read_response(
        StatusCode::OK,
        meta.content_type.as_deref(),
        result.bytes,
        result.next_offset,
        result.up_to_date,
        cursor,
        Some(etag),
    )
}

/// Long-poll: reply immediately when behind the tail, otherwise suspend
/// until new bytes, deletion, or the server timeout.
async fn handle_long_poll(
    state: AppState,
    path: String,
    offset: Offset,
    cursor: String,
    meta: StreamMeta,
) -> Result<Response, ApiError> {
    // Subscribe before the catch-up read so an append racing this
    // request is never missed.
    let mut rx = state.store.subscribe();

    let result = state.store.read(&path, &offset)?;
    if !result.bytes.is_empty() {
        let start = result.next_offset - result.bytes.len() as u64;
        let etag = generate_etag(&path, &format_offset(start), &format_offset(result.next_offset));
        return read_response(
            StatusCode::OK,
            meta.content_type.as_deref(),
            result.bytes,
            result.next_offset,
            result.up_to_date,
            &cursor,
            Some(etag),
        );
    }

    let from = result.next_offset;
    let deadline = Duration::from_millis(state.options.long_poll_timeout_ms);

    let waited = timeout(deadline, async {
        loop {
            match rx.recv().await {
                Ok(event) if event.path == path => match event.kind {
                    StreamEventKind::Appended { .. } => {
                        match state.store.read(&path, &Offset::At(from)) {
                            Ok(result) if !result.bytes.is_empty() => {
                                return Some(Ok(result));
                            }
                            Ok(_) => continue,
                            Err(e) => return Some(Err(e)),
                        }
                    }
                    StreamEventKind::Deleted => {
                        return Some(Err(StoreError::NotFound(path.clone())));
                    }
                },
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    match state.store.read(&path, &Offset::At(from)) {
                        Ok(result) if !result.bytes.is_empty() => return Some(Ok(result)),
                        Ok(_) => continue,
                        Err(e) => return Some(Err(e)),
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await;

    match waited {
        Ok(Some(Ok(result))) => {
            let start = result.next_offset - result.bytes.len() as u64;
            let etag =
                generate_etag(&path, &format_offset(start), &format_offset(result.next_offset));
            read_response(
                StatusCode::OK,
                meta.content_type.as_deref(),
                result.bytes,
                result.next_offset,
                result.up_to_date,
                &cursor,
                Some(etag),
            )
        }
        Ok(Some(Err(err))) => Err(err.into()),
        // Timeout (or a closed channel): no new bytes, still up to date.
        Ok(None) | Err(_) => read_response(
            StatusCode::NO_CONTENT,
            None,
            Bytes::new(),
            from,
            true,
            &cursor,
            None,
        ),
    }
}

/// SSE subscription.
fn handle_sse(
    state: &AppState,
    path: String,
    offset: &Offset,
    client_cursor: Option<String>,
    meta: &StreamMeta,
) -> Result<Response, ApiError> {
    let from = offset.resolve(meta.next_offset);
    if from > meta.next_offset {
        return Err(ApiError::bad_request(
            code::INVALID_OFFSET,
            format!("offset {} is beyond the stream tail {}", from, meta.next_offset),
        ));
    }

    let stream = sse::subscribe(
        state.store.clone(),
        SseParams {
            path,
            from,
            client_cursor,
            cursor_config: state.cursor_config(),
            idle_interval: Duration::from_millis(state.options.long_poll_timeout_ms),
        },
    );

    Ok(Sse::new(stream)
        .keep_alive(
            axum::response::sse::KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keepalive"),
        )
        .into_response())
}

/// POST - append to a stream.
async fn handle_append(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers_in: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let path = normalize_path(&path);

    if body.is_empty() {
        return Err(ApiError::bad_request(code::BAD_REQUEST, "empty body not allowed"));
    }
    check_body_size(&state, &body)?;

    let content_type = header_string(&headers_in, &header::CONTENT_TYPE);
    let seq = header_string(&headers_in, &headers::STREAM_SEQ);
    let producer = parse_producer(&headers_in)?;

    let outcome = state.store.append(
        &path,
        body,
        content_type.as_deref(),
        seq.as_deref(),
        producer.as_ref().map(|(id, claim)| (id.as_str(), *claim)),
    )?;

    let status = if outcome.duplicate {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::OK
    };
    Response::builder()
        .status(status)
        .header(headers::STREAM_NEXT_OFFSET, format_offset(outcome.next_offset))
        .body(Body::empty())
        .map_err(|e| ApiError::internal(e.to_string()))
}

/// DELETE - delete a stream. Idempotent: absent streams are a success.
async fn handle_delete(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> impl IntoResponse {
    let path = normalize_path(&path);
    state.store.delete(&path);
    StatusCode::NO_CONTENT
}

fn read_response(
    status: StatusCode,
    content_type: Option<&str>,
    body: Bytes,
    next_offset: u64,
    up_to_date: bool,
    cursor: &str,
    etag: Option<String>,
) -> Result<Response, ApiError> {
    let mut response = Response::builder()
        .status(status)
        .header(headers::STREAM_NEXT_OFFSET, format_offset(next_offset))
        .header(headers::STREAM_UP_TO_DATE, if up_to_date { "true" } else { "false" })
        .header(headers::STREAM_CURSOR, cursor);
    if let Some(etag) = etag {
        response = response.header(header::ETAG, etag);
    }
    if status != StatusCode::NO_CONTENT {
        if let Some(ct) = content_type {
            response = response.header(header::CONTENT_TYPE, ct);
        }
    }
    let body = if status == StatusCode::NO_CONTENT {
        Body::empty()
    } else {
        Body::from(body)
    };
    response
        .body(body)
        .map_err(|e| ApiError::internal(e.to_string()))
}

/// Extract the producer triple. All three headers or none; anything
/// else is a malformed request.
fn parse_producer(headers_in: &HeaderMap) -> Result<Option<(String, ProducerClaim)>, ApiError> {
    let id = header_string(headers_in, &headers::PRODUCER_ID);
    let epoch = header_string(headers_in, &headers::PRODUCER_EPOCH);
    let seq = header_string(headers_in, &headers::PRODUCER_SEQ);

    match (id, epoch, seq) {
        (None, None, None) => Ok(None),
        (Some(id), Some(epoch), Some(seq)) => {
            let epoch: u64 = epoch.parse().map_err(|_| {
                ApiError::bad_request(code::BAD_REQUEST, "Producer-Epoch must be a non-negative integer")
            })?;
            let seq: u64 = seq.parse().map_err(|_| {
                ApiError::bad_request(code::BAD_REQUEST, "Producer-Seq must be a non-negative integer")
            })?;
            Ok(Some((id, ProducerClaim { epoch, seq })))
        }
        _ => Err(ApiError::bad_request(
            code::BAD_REQUEST,
            "Producer-Id, Producer-Epoch and Producer-Seq must be supplied together",
        )),
    }
}

fn header_string(headers_in: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers_in
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn parse_ttl(headers_in: &HeaderMap) -> Result<Option<u64>, ApiError> {
    match headers_in.get(&headers::STREAM_TTL) {
        None => Ok(None),
        Some(v) => v
            .to_str()
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Some)
            .ok_or_else(|| {
                ApiError::bad_request(code::BAD_REQUEST, "Stream-TTL must be a number of seconds")
            }),
    }
}

fn parse_expires_at(headers_in: &HeaderMap) -> Result<Option<DateTime<Utc>>, ApiError> {
    match headers_in.get(&headers::STREAM_EXPIRES_AT) {
        None => Ok(None),
        Some(v) => v
            .to_str()
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .ok_or_else(|| {
                ApiError::bad_request(
                    code::BAD_REQUEST,
                    "Stream-Expires-At must be an ISO-8601 timestamp",
                )
            }),
    }
}

fn check_body_size(state: &AppState, body: &Bytes) -> Result<(), ApiError> {
    if body.len() > state.options.max_append_bytes {
        return Err(ApiError::too_large(format!(
            "body of {} bytes exceeds the {} byte limit",
            body.len(),
            state.options.max_append_bytes
        )));
    }
    Ok(())
}

/// Generate an ETag for a read response.
fn generate_etag(path: &str, start_offset: &str, end_offset: &str) -> String {
    use base64::Engine;
    let path_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(path);
    format!("\"{}:{}:{}\"", path_b64, start_offset, end_offset)
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(path) => ApiError::not_found(&path),
            StoreError::ContentTypeConflict { existing } => ApiError::conflict(
                code::CONFLICT_EXISTS,
                format!("stream already exists with content type {:?}", existing),
            ),
            StoreError::AppendContentTypeMismatch { expected, actual } => ApiError::conflict(
                code::CONFLICT_EXISTS,
                format!("content-type mismatch: stream is {}, append is {}", expected, actual),
            ),
            StoreError::SequenceConflict { last, received } => ApiError::conflict(
                code::CONFLICT_SEQ,
                format!("sequence {} is not after {}", received, last),
            ),
            StoreError::OffsetBeyondTail { offset, next_offset } => ApiError::bad_request(
                code::INVALID_OFFSET,
                format!("offset {} is beyond the stream tail {}", offset, next_offset),
            ),
            StoreError::StaleEpoch { current, received } => {
                ApiError::forbidden(
                    code::STALE_EPOCH,
                    format!("epoch {} is fenced; current epoch is {}", received, current),
                )
                .with_header(headers::PRODUCER_EPOCH, current)
            }
            StoreError::SequenceGap { expected, received } => {
                ApiError::conflict(
                    code::SEQUENCE_GAP,
                    format!("sequence gap: expected {}, received {}", expected, received),
                )
                .with_header(headers::PRODUCER_EXPECTED_SEQ, expected)
                .with_header(headers::PRODUCER_RECEIVED_SEQ, received)
            }
            StoreError::EmptyBody => {
                ApiError::bad_request(code::BAD_REQUEST, "empty body not allowed")
            }
            StoreError::TtlConflict => ApiError::bad_request(
                code::BAD_REQUEST,
                "cannot specify both Stream-TTL and Stream-Expires-At",
            ),
            StoreError::Json(err) => match err {
                crate::json::JsonBatchError::EmptyArray => {
                    ApiError::bad_request(code::BAD_REQUEST, "empty arrays not allowed on append")
                }
                crate::json::JsonBatchError::Invalid(msg) => {
                    ApiError::bad_request(code::PARSE_ERROR, msg)
                }
            },
        }
    }
}

/// Build the store (file-backed when a data dir is configured), start
/// maintenance, and serve until the process exits.
pub async fn start_server(options: ServerOptions) -> std::io::Result<()> {
    let (router, addr) = prepare(options, None)?;
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("durable streams server listening on {}", addr);
    axum::serve(listener, router).await
}

/// Assemble the router and bind address for `options`, mounting the
/// proxy profile when configured.
pub fn prepare(
    options: ServerOptions,
    proxy: Option<crate::proxy::ProxyConfig>,
) -> std::io::Result<(Router, String)> {
    let store = match &options.data_dir {
        Some(dir) => {
            let persister = Persister::open(dir)?;
            StreamStore::with_persistence(persister)?
        }
        None => StreamStore::new(),
    };
    maintenance::spawn_sweeper(store.clone(), Duration::from_millis(options.sweep_interval_ms));

    let addr = format!("{}:{}", options.host, options.port);
    let state = AppState {
        store,
        options: Arc::new(options),
    };

    let mut router = create_router(state.clone());
    if let Some(config) = proxy {
        let base_path = config.base_path.clone();
        let proxy_state = crate::proxy::ProxyState::new(state, config)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        router = Router::new()
            .nest(&base_path, crate::proxy::router(proxy_state))
            .merge(router);
        info!(base_path = %base_path, "proxy profile enabled");
    }
    Ok((router, addr))
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use super::*;

    fn test_state() -> AppState {
        AppState {
            store: StreamStore::new(),
            options: Arc::new(ServerOptions {
                long_poll_timeout_ms: 100,
                compression: false,
                ..Default::default()
            }),
        }
    }

    fn app(state: &AppState) -> Router {
        create_router(state.clone())
    }

    async fn send(router: Router, req: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = router.oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, body)
    }

    fn put(uri: &str, ct: &str) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .header("Content-Type", ct)
            .body(Body::empty())
            .unwrap()
    }

    fn post(uri: &str, ct: &str, body: &'static [u8]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", ct)
            .body(Body::from(body))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn offset_header(headers: &HeaderMap) -> String {
        headers
            .get("stream-next-offset")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn create_append_read_round_trip() {
        let state = test_state();

        let (status, headers, _) = send(app(&state), put("/s1", "text/plain")).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(offset_header(&headers), "0");

        let (status, headers, _) = send(app(&state), post("/s1", "text/plain", b"hello")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(offset_header(&headers), "5");

        let (status, headers, body) = send(app(&state), get_req("/s1?offset=-1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"hello");
        assert_eq!(offset_header(&headers), "5");
        assert_eq!(headers.get("stream-up-to-date").unwrap(), "true");
        assert!(headers.contains_key("etag"));
        assert!(headers.contains_key("stream-cursor"));
    }

    #[tokio::test]
    async fn create_is_idempotent_and_conflicts_on_content_type() {
        let state = test_state();

        let (status, _, _) = send(app(&state), put("/s", "text/plain")).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _, _) = send(app(&state), put("/s", "text/plain")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _, body) = send(app(&state), put("/s", "application/json")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(String::from_utf8_lossy(&body).contains("CONFLICT_EXISTS"));
    }

    #[tokio::test]
    async fn head_reports_metadata() {
        let state = test_state();
        send(app(&state), put("/s", "text/plain")).await;
        send(app(&state), post("/s", "text/plain", b"hello")).await;

        let (status, headers, _) = send(
            app(&state),
            Request::builder()
                .method("HEAD")
                .uri("/s")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(offset_header(&headers), "5");
        assert_eq!(headers.get("content-type").unwrap(), "text/plain");

        let (status, _, _) = send(
            app(&state),
            Request::builder()
                .method("HEAD")
                .uri("/missing")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn producer_dedup_returns_original_offset() {
        let state = test_state();
        send(app(&state), put("/s1", "text/plain")).await;
        send(app(&state), post("/s1", "text/plain", b"hello")).await;

        let producer_post = || {
            Request::builder()
                .method("POST")
                .uri("/s1")
                .header("Content-Type", "text/plain")
                .header("Producer-Id", "p")
                .header("Producer-Epoch", "0")
                .header("Producer-Seq", "0")
                .body(Body::from(&b"abc"[..]))
                .unwrap()
        };

        let (status, headers, _) = send(app(&state), producer_post()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(offset_header(&headers), "8");

        let (status, headers, _) = send(app(&state), producer_post()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(offset_header(&headers), "8");

        // The log did not grow.
        let (_, headers, body) = send(app(&state), get_req("/s1?offset=-1")).await;
        assert_eq!(offset_header(&headers), "8");
        assert_eq!(&body[..], b"helloabc");
    }

    #[tokio::test]
    async fn fencing_rejects_stale_epoch_and_allows_reclaim() {
        let state = test_state();
        send(app(&state), put("/s", "text/plain")).await;

        let with_producer = |epoch: &str, seq: &str| {
            Request::builder()
                .method("POST")
                .uri("/s")
                .header("Content-Type", "text/plain")
                .header("Producer-Id", "p")
                .header("Producer-Epoch", epoch)
                .header("Producer-Seq", seq)
                .body(Body::from(&b"x"[..]))
                .unwrap()
        };

        send(app(&state), with_producer("3", "0")).await;

        let (status, headers, _) = send(app(&state), with_producer("2", "0")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(headers.get("producer-epoch").unwrap(), "3");

        let (status, _, _) = send(app(&state), with_producer("4", "0")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn sequence_gap_carries_diagnostic_headers() {
        let state = test_state();
        send(app(&state), put("/s", "text/plain")).await;

        let with_seq = |seq: &str| {
            Request::builder()
                .method("POST")
                .uri("/s")
                .header("Content-Type", "text/plain")
                .header("Producer-Id", "p")
                .header("Producer-Epoch", "0")
                .header("Producer-Seq", seq)
                .body(Body::from(&b"x"[..]))
                .unwrap()
        };

        for seq in ["0", "1", "2", "3", "4"] {
            send(app(&state), with_seq(seq)).await;
        }

        let (status, headers, _) = send(app(&state), with_seq("7")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(headers.get("producer-expected-seq").unwrap(), "5");
        assert_eq!(headers.get("producer-received-seq").unwrap(), "7");
    }

    #[tokio::test]
    async fn incomplete_producer_headers_are_rejected() {
        let state = test_state();
        send(app(&state), put("/s", "text/plain")).await;

        let (status, _, _) = send(
            app(&state),
            Request::builder()
                .method("POST")
                .uri("/s")
                .header("Content-Type", "text/plain")
                .header("Producer-Id", "p")
                .body(Body::from(&b"x"[..]))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_append_is_bad_request() {
        let state = test_state();
        send(app(&state), put("/s", "text/plain")).await;
        let (status, _, body) = send(app(&state), post("/s", "text/plain", b"")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(String::from_utf8_lossy(&body).contains("BAD_REQUEST"));
    }

    #[tokio::test]
    async fn offset_beyond_tail_is_invalid() {
        let state = test_state();
        send(app(&state), put("/s", "text/plain")).await;
        send(app(&state), post("/s", "text/plain", b"hello")).await;

        let (status, _, body) = send(app(&state), get_req("/s?offset=6")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(String::from_utf8_lossy(&body).contains("INVALID_OFFSET"));

        let (status, _, _) = send(app(&state), get_req("/s?offset=bogus")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn read_at_tail_is_empty_and_up_to_date() {
        let state = test_state();
        send(app(&state), put("/s", "text/plain")).await;
        send(app(&state), post("/s", "text/plain", b"hello")).await;

        let (status, headers, body) = send(app(&state), get_req("/s?offset=5")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
        assert_eq!(headers.get("stream-up-to-date").unwrap(), "true");
        assert_eq!(offset_header(&headers), "5");

        let (status, _, body) = send(app(&state), get_req("/s?offset=now")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn long_poll_times_out_with_204() {
        let state = test_state();
        send(app(&state), put("/s", "text/plain")).await;
        send(app(&state), post("/s", "text/plain", b"hello")).await;

        let started = std::time::Instant::now();
        let (status, headers, body) =
            send(app(&state), get_req("/s?offset=5&live=long-poll")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_empty());
        assert_eq!(offset_header(&headers), "5");
        assert_eq!(headers.get("stream-up-to-date").unwrap(), "true");
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn long_poll_wakes_on_append() {
        let state = test_state();
        send(app(&state), put("/s", "text/plain")).await;

        let poller = app(&state);
        let writer = app(&state);
        let write = async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            send(writer, post("/s", "text/plain", b"fresh")).await
        };

        let ((status, headers, body), _) = tokio::join!(
            send(poller, get_req("/s?offset=0&live=long-poll")),
            write
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"fresh");
        assert_eq!(offset_header(&headers), "5");
        assert_eq!(headers.get("stream-up-to-date").unwrap(), "true");
    }

    #[tokio::test]
    async fn long_poll_returns_available_bytes_immediately() {
        let state = test_state();
        send(app(&state), put("/s", "text/plain")).await;
        send(app(&state), post("/s", "text/plain", b"hello")).await;

        let started = std::time::Instant::now();
        let (status, _, body) = send(app(&state), get_req("/s?offset=0&live=long-poll")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"hello");
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_resets_offsets() {
        let state = test_state();
        send(app(&state), put("/s", "text/plain")).await;
        send(app(&state), post("/s", "text/plain", b"hello")).await;

        let delete = || {
            Request::builder()
                .method("DELETE")
                .uri("/s")
                .body(Body::empty())
                .unwrap()
        };
        let (status, _, _) = send(app(&state), delete()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _, _) = send(app(&state), delete()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _, _) = send(app(&state), get_req("/s?offset=-1")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // A fresh stream at the same path starts at offset 0.
        let (status, headers, _) = send(app(&state), put("/s", "text/plain")).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(offset_header(&headers), "0");
    }

    #[tokio::test]
    async fn json_array_flattens_on_the_wire() {
        let state = test_state();
        send(app(&state), put("/j", "application/json")).await;

        let (status, headers, _) = send(
            app(&state),
            post("/j", "application/json", br#"[{"n":1},{"n":2}]"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(offset_header(&headers), "15");

        let (_, _, body) = send(app(&state), get_req("/j?offset=-1")).await;
        assert_eq!(&body[..], br#"{"n":1},{"n":2}"#);
    }

    #[tokio::test]
    async fn sse_replays_and_ends_on_delete() {
        let state = test_state();
        send(app(&state), put("/j", "application/json")).await;
        send(
            app(&state),
            post("/j", "application/json", br#"[{"n":1},{"n":2}]"#),
        )
        .await;

        let reader = app(&state);
        let closer = app(&state);
        let close = async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            send(
                closer,
                Request::builder()
                    .method("DELETE")
                    .uri("/j")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
        };

        let ((status, headers, body), _) =
            tokio::join!(send(reader, get_req("/j?offset=-1&live=sse")), close);
        assert_eq!(status, StatusCode::OK);
        assert!(headers
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("event: data\ndata: {\"n\":1}\n\n"));
        assert!(text.contains("event: data\ndata: {\"n\":2}\n\n"));
        assert!(text.contains("event: control"));
        assert!(text.contains(r#""streamNextOffset":"15""#));
        assert!(text.contains(r#""upToDate":true"#));
    }

    #[tokio::test]
    async fn options_advertises_the_method_matrix() {
        let state = test_state();
        let (status, headers, _) = send(
            app(&state),
            Request::builder()
                .method("OPTIONS")
                .uri("/any/stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let methods = headers
            .get("access-control-allow-methods")
            .unwrap()
            .to_str()
            .unwrap();
        for method in ["GET", "HEAD", "POST", "PUT", "DELETE", "PATCH"] {
            assert!(methods.contains(method));
        }
    }

    #[tokio::test]
    async fn weak_stream_seq_conflicts_on_regression() {
        let state = test_state();
        send(app(&state), put("/s", "text/plain")).await;

        let with_seq = |seq: &str| {
            Request::builder()
                .method("POST")
                .uri("/s")
                .header("Content-Type", "text/plain")
                .header("Stream-Seq", seq)
                .body(Body::from(&b"x"[..]))
                .unwrap()
        };

        let (status, _, _) = send(app(&state), with_seq("a2")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _, body) = send(app(&state), with_seq("a1")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(String::from_utf8_lossy(&body).contains("CONFLICT_SEQ"));
    }

    #[tokio::test]
    async fn append_to_missing_stream_is_404() {
        let state = test_state();
        let (status, _, body) = send(app(&state), post("/none", "text/plain", b"x")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(String::from_utf8_lossy(&body).contains("STREAM_NOT_FOUND"));
    }

    #[tokio::test]
    async fn put_with_initial_data_appends_to_existing_stream() {
        let state = test_state();

        let with_body = |body: &'static [u8]| {
            Request::builder()
                .method("PUT")
                .uri("/s")
                .header("Content-Type", "text/plain")
                .body(Body::from(body))
                .unwrap()
        };

        let (status, headers, _) = send(app(&state), with_body(b"seed")).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(offset_header(&headers), "4");

        let (status, headers, _) = send(app(&state), with_body(b"more")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(offset_header(&headers), "8");

        let (_, _, body) = send(app(&state), get_req("/s?offset=-1")).await;
        assert_eq!(&body[..], b"seedmore");
    }
}
