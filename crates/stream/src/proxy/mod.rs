//! Proxy profile: forward client requests to allowlisted upstreams and
//! multiplex the response bytes through an internal stream.
//!
//! A successful create returns a signed location URL for the internal
//! stream; readers present either the signed URL or the service secret.
//! Upstream bytes are framed (`S`/`D`/`C`/`A`/`E`) with a per-stream
//! response id, so one stream can carry a sequence of upstream
//! responses.

pub mod allowlist;
pub mod frames;
pub mod sign;
pub mod upstream;

use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    error::{code, ApiError},
    server::{headers, read_stream, AppState, ReadQuery},
    store::{StoreError, StreamStore},
    types::StreamConfig,
};

use allowlist::{Allowlist, AllowlistError};
use frames::Frame;
use sign::{SignatureError, UrlSigner};

/// Content type of the internal frame streams.
const FRAME_CONTENT_TYPE: &str = "application/x-ndjson";

const STREAM_SIGNED_URL_TTL: &str = "stream-signed-url-ttl";

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Service secret for bearer auth and URL signing.
    pub secret: String,
    /// Hosts (and their subdomains) requests may be forwarded to.
    pub allowed_hosts: Vec<String>,
    /// Mount point of the proxy router, e.g. `/proxy`.
    pub base_path: String,
    /// Default signed-URL lifetime in seconds.
    pub default_url_ttl_seconds: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            allowed_hosts: Vec::new(),
            base_path: "/proxy".to_string(),
            default_url_ttl_seconds: 3600,
        }
    }
}

/// Errors specific to the proxy surface.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("missing Upstream-Url header")]
    MissingUpstreamUrl,

    #[error("missing Upstream-Method header")]
    MissingUpstreamMethod,

    #[error("invalid upstream method: {0}")]
    InvalidUpstreamMethod(String),

    #[error(transparent)]
    Allowlist(#[from] AllowlistError),

    #[error("upstream responded with a redirect")]
    Redirect,

    #[error("upstream responded with status {status}")]
    UpstreamStatus { status: u16, body: Bytes },

    #[error("upstream unreachable: {0}")]
    Unreachable(String),

    #[error("stream is closed")]
    StreamClosed,

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl From<StoreError> for ProxyError {
    fn from(err: StoreError) -> Self {
        ProxyError::Api(err.into())
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::MissingUpstreamUrl => {
                ApiError::bad_request(code::MISSING_UPSTREAM_URL, "missing Upstream-Url header")
                    .into_response()
            }
            ProxyError::MissingUpstreamMethod => ApiError::bad_request(
                code::MISSING_UPSTREAM_METHOD,
                "missing Upstream-Method header",
            )
            .into_response(),
            ProxyError::InvalidUpstreamMethod(method) => ApiError::bad_request(
                code::INVALID_UPSTREAM_METHOD,
                format!("invalid upstream method: {}", method),
            )
            .into_response(),
            ProxyError::Allowlist(AllowlistError::InvalidUrl(msg)) => {
                ApiError::bad_request(code::BAD_REQUEST, msg).into_response()
            }
            ProxyError::Allowlist(err) => {
                ApiError::forbidden(code::ALLOWLIST_DENIED, err.to_string()).into_response()
            }
            ProxyError::Redirect => ApiError::bad_request(
                code::REDIRECT_NOT_ALLOWED,
                "upstream redirects are not followed",
            )
            .into_response(),
            ProxyError::UpstreamStatus { status, body } => {
                // The upstream body is surfaced verbatim.
                Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .header(headers::UPSTREAM_STATUS, status.to_string())
                    .body(Body::from(body))
                    .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
            }
            ProxyError::Unreachable(msg) => {
                // A proxy-defined status marks "no upstream response".
                ApiError::new(StatusCode::BAD_GATEWAY, code::UPSTREAM_ERROR, msg)
                    .with_header(headers::UPSTREAM_STATUS, 599)
                    .into_response()
            }
            ProxyError::StreamClosed => {
                ApiError::conflict(code::STREAM_CLOSED, "stream is closed").into_response()
            }
            ProxyError::Api(err) => err.into_response(),
        }
    }
}

/// Lifecycle of one proxy session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Initialized,
    Streaming,
    Completed,
    Aborted,
    Errored,
}

impl SessionPhase {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionPhase::Completed | SessionPhase::Aborted | SessionPhase::Errored
        )
    }
}

struct Session {
    stream_path: String,
    phase: SessionPhase,
    /// Response id handed to the next upstream response; starts at 1.
    next_response_id: u64,
    /// Abort signal for the in-flight response, if any.
    active_abort: Option<watch::Sender<bool>>,
    upstream_content_type: Option<String>,
}

type Sessions = Arc<Mutex<HashMap<String, Session>>>;

/// Shared proxy state.
#[derive(Clone)]
pub struct ProxyState {
    app: AppState,
    config: Arc<ProxyConfig>,
    signer: Arc<UrlSigner>,
    allowlist: Arc<Allowlist>,
    http: reqwest::Client,
    sessions: Sessions,
}

impl ProxyState {
    pub fn new(app: AppState, config: ProxyConfig) -> Result<Self, ProxyError> {
        let signer = Arc::new(UrlSigner::new(&config.secret));
        let allowlist = Arc::new(Allowlist::new(config.allowed_hosts.clone()));
        Ok(Self {
            app,
            config: Arc::new(config),
            signer,
            allowlist,
            http: upstream::build_client()?,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn stream_path(&self, id: &str) -> String {
        format!("{}/streams/{}", self.config.base_path, id)
    }

    fn signed_location(&self, id: &str, ttl_seconds: u64) -> String {
        let expires = Utc::now().timestamp() + ttl_seconds as i64;
        let signature = self.signer.sign(id, expires);
        format!(
            "{}?expires={}&signature={}",
            self.stream_path(id),
            expires,
            signature
        )
    }
}

/// Query parameters on proxy stream endpoints.
#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
    pub offset: Option<String>,
    pub live: Option<String>,
    pub cursor: Option<String>,
    pub action: Option<String>,
    pub expires: Option<String>,
    pub signature: Option<String>,
    #[serde(rename = "responseId")]
    pub response_id: Option<String>,
}

/// Build the proxy router; mount it under `config.base_path`.
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/", post(handle_create))
        .route(
            "/streams/{id}",
            post(handle_forward)
                .get(handle_read)
                .head(handle_head)
                .delete(handle_delete)
                .patch(handle_action),
        )
        .with_state(state)
}

/// POST / - open a session: forward one upstream request and return the
/// signed location of its frame stream.
async fn handle_create(
    State(state): State<ProxyState>,
    headers_in: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    require_service_auth(&state, &headers_in)?;
    let spec = upstream::forward_spec(&headers_in, &state.allowlist)?;
    let url_ttl = signed_url_ttl(&state, &headers_in);

    let response = upstream::send(&state.http, spec, body).await?;
    let status = response.status().as_u16();
    let upstream_ct = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let id = uuid::Uuid::new_v4().simple().to_string();
    let stream_path = state.stream_path(&id);
    state.app.store.create(
        &stream_path,
        StreamConfig {
            content_type: Some(FRAME_CONTENT_TYPE.to_string()),
            ..Default::default()
        },
    )?;

    let rid = 1;
    let (abort_tx, abort_rx) = watch::channel(false);
    state.sessions.lock().insert(
        id.clone(),
        Session {
            stream_path: stream_path.clone(),
            phase: SessionPhase::Streaming,
            next_response_id: rid + 1,
            active_abort: Some(abort_tx),
            upstream_content_type: upstream_ct.clone(),
        },
    );

    start_response(&state, &id, &stream_path, rid, status, response, abort_rx)?;
    info!(stream = %stream_path, upstream_status = status, "proxy session opened");

    let location = state.signed_location(&id, url_ttl);
    let mut builder = Response::builder()
        .status(StatusCode::CREATED)
        .header(header::LOCATION, location)
        .header(headers::STREAM_RESPONSE_ID, rid.to_string())
        .header(headers::UPSTREAM_STATUS, status.to_string());
    if let Some(ct) = upstream_ct {
        builder = builder.header(headers::UPSTREAM_CONTENT_TYPE, ct);
    }
    builder
        .body(Body::empty())
        .map_err(|e| ProxyError::Api(ApiError::internal(e.to_string())))
}

/// POST /streams/{id} - forward a further upstream request over an
/// established session.
async fn handle_forward(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
    headers_in: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    require_service_auth(&state, &headers_in)?;
    let spec = upstream::forward_spec(&headers_in, &state.allowlist)?;

    let (stream_path, rid, abort_rx) = {
        let mut sessions = state.sessions.lock();
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| ProxyError::Api(ApiError::not_found(&id)))?;
        if session.phase != SessionPhase::Initialized {
            return Err(ProxyError::StreamClosed);
        }
        let rid = session.next_response_id;
        session.next_response_id += 1;
        session.phase = SessionPhase::Streaming;
        let (abort_tx, abort_rx) = watch::channel(false);
        session.active_abort = Some(abort_tx);
        (session.stream_path.clone(), rid, abort_rx)
    };

    let response = match upstream::send(&state.http, spec, body).await {
        Ok(response) => response,
        Err(err) => {
            let mut sessions = state.sessions.lock();
            if let Some(session) = sessions.get_mut(&id) {
                session.phase = SessionPhase::Initialized;
                session.active_abort = None;
                session.next_response_id = rid;
            }
            return Err(err);
        }
    };

    let status = response.status().as_u16();
    let upstream_ct = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    if let Some(session) = state.sessions.lock().get_mut(&id) {
        session.upstream_content_type = upstream_ct.clone();
    }

    start_response(&state, &id, &stream_path, rid, status, response, abort_rx)?;

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(headers::STREAM_RESPONSE_ID, rid.to_string())
        .header(headers::UPSTREAM_STATUS, status.to_string());
    if let Some(ct) = upstream_ct {
        builder = builder.header(headers::UPSTREAM_CONTENT_TYPE, ct);
    }
    builder
        .body(Body::empty())
        .map_err(|e| ProxyError::Api(ApiError::internal(e.to_string())))
}

/// Write the `S` frame and spawn the pipe task for one response.
fn start_response(
    state: &ProxyState,
    id: &str,
    stream_path: &str,
    rid: u64,
    status: u16,
    response: reqwest::Response,
    abort_rx: watch::Receiver<bool>,
) -> Result<(), ProxyError> {
    let response_headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let start = Frame::Start {
        rid,
        status,
        headers: response_headers,
    };
    state
        .app
        .store
        .append(stream_path, start.encode(), None, None, None)?;

    tokio::spawn(pipe(
        state.app.store.clone(),
        state.sessions.clone(),
        id.to_string(),
        stream_path.to_string(),
        rid,
        response,
        abort_rx,
    ));
    Ok(())
}

/// Pipe upstream bytes into the stream as `D` frames until completion,
/// abort, or error, then write the terminal frame and settle the
/// session phase.
async fn pipe(
    store: Arc<StreamStore>,
    sessions: Sessions,
    id: String,
    stream_path: String,
    rid: u64,
    mut response: reqwest::Response,
    mut abort_rx: watch::Receiver<bool>,
) {
    let (terminal, phase) = loop {
        tokio::select! {
            changed = abort_rx.changed() => {
                if changed.is_err() || *abort_rx.borrow() {
                    break (Frame::Aborted { rid }, SessionPhase::Aborted);
                }
            }
            chunk = response.chunk() => match chunk {
                Ok(Some(bytes)) => {
                    if store
                        .append(&stream_path, Frame::data(rid, &bytes).encode(), None, None, None)
                        .is_err()
                    {
                        // Stream deleted under us; nothing left to record.
                        debug!(stream = %stream_path, "frame stream gone; stopping pipe");
                        return;
                    }
                }
                Ok(None) => break (Frame::Complete { rid }, SessionPhase::Completed),
                Err(err) => {
                    warn!(stream = %stream_path, error = %err, "upstream read failed");
                    break (
                        Frame::Error { rid, message: err.to_string() },
                        SessionPhase::Errored,
                    );
                }
            }
        }
    };

    if let Err(err) = store.append(&stream_path, terminal.encode(), None, None, None) {
        debug!(stream = %stream_path, error = %err, "could not write terminal frame");
    }

    let mut sessions = sessions.lock();
    if let Some(session) = sessions.get_mut(&id) {
        session.phase = phase;
        session.active_abort = None;
    }
}

/// GET /streams/{id} - read the frame stream (catch-up, long-poll, SSE).
async fn handle_read(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
    Query(query): Query<ProxyQuery>,
    headers_in: HeaderMap,
) -> Result<Response, ProxyError> {
    authorize(&state, &id, &headers_in, &query)?;
    let stream_path = {
        let sessions = state.sessions.lock();
        sessions
            .get(&id)
            .map(|s| s.stream_path.clone())
            .ok_or_else(|| ProxyError::Api(ApiError::not_found(&id)))?
    };
    read_stream(
        &state.app,
        stream_path,
        ReadQuery {
            offset: query.offset,
            live: query.live,
            cursor: query.cursor,
        },
    )
    .await
    .map_err(ProxyError::Api)
}

/// HEAD /streams/{id} - stream metadata plus the upstream content type.
async fn handle_head(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
    Query(query): Query<ProxyQuery>,
    headers_in: HeaderMap,
) -> Result<Response, ProxyError> {
    authorize(&state, &id, &headers_in, &query)?;
    let (stream_path, upstream_ct) = {
        let sessions = state.sessions.lock();
        let session = sessions
            .get(&id)
            .ok_or_else(|| ProxyError::Api(ApiError::not_found(&id)))?;
        (session.stream_path.clone(), session.upstream_content_type.clone())
    };
    let meta = state
        .app
        .store
        .head(&stream_path)
        .ok_or_else(|| ProxyError::Api(ApiError::not_found(&stream_path)))?;

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(headers::STREAM_NEXT_OFFSET, meta.next_offset.to_string())
        .header(header::CONTENT_TYPE, FRAME_CONTENT_TYPE);
    if let Some(ct) = upstream_ct {
        builder = builder.header(headers::UPSTREAM_CONTENT_TYPE, ct);
    }
    builder
        .body(Body::empty())
        .map_err(|e| ProxyError::Api(ApiError::internal(e.to_string())))
}

/// DELETE /streams/{id} - abort in-flight work and drop the stream.
async fn handle_delete(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
    headers_in: HeaderMap,
) -> Result<Response, ProxyError> {
    require_service_auth(&state, &headers_in)?;
    let removed = state.sessions.lock().remove(&id);
    if let Some(session) = removed {
        if let Some(abort) = &session.active_abort {
            let _ = abort.send(true);
        }
        state.app.store.delete(&session.stream_path);
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// PATCH /streams/{id}?action=... - abort or connect.
///
/// Session management is service-only: the signed location URL grants
/// reads, never control of the upstream session.
async fn handle_action(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
    Query(query): Query<ProxyQuery>,
    headers_in: HeaderMap,
) -> Result<Response, ProxyError> {
    require_service_auth(&state, &headers_in)?;
    match query.action.as_deref() {
        Some("abort") => {
            let targeted: Option<u64> = match query.response_id.as_deref() {
                Some(raw) => Some(raw.parse().map_err(|_| {
                    ProxyError::Api(ApiError::bad_request(
                        code::BAD_REQUEST,
                        "responseId must be a non-negative integer",
                    ))
                })?),
                None => None,
            };

            let mut sessions = state.sessions.lock();
            let session = sessions
                .get_mut(&id)
                .ok_or_else(|| ProxyError::Api(ApiError::not_found(&id)))?;

            let active_rid = session.next_response_id - 1;
            if let Some(target) = targeted {
                if target != active_rid {
                    // Nothing in flight for that response; abort is a no-op.
                    return Ok(StatusCode::NO_CONTENT.into_response());
                }
            }
            if let Some(abort) = session.active_abort.take() {
                let _ = abort.send(true);
            } else if !session.phase.is_terminal() {
                session.phase = SessionPhase::Aborted;
            }
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        Some("connect") => {
            let url_ttl = signed_url_ttl(&state, &headers_in);
            {
                let mut sessions = state.sessions.lock();
                let session = sessions
                    .get_mut(&id)
                    .ok_or_else(|| ProxyError::Api(ApiError::not_found(&id)))?;
                if session.phase.is_terminal() {
                    session.phase = SessionPhase::Initialized;
                }
                if session.phase == SessionPhase::Streaming {
                    return Err(ProxyError::StreamClosed);
                }
            }
            let location = state.signed_location(&id, url_ttl);
            Response::builder()
                .status(StatusCode::OK)
                .header(header::LOCATION, location)
                .body(Body::empty())
                .map_err(|e| ProxyError::Api(ApiError::internal(e.to_string())))
        }
        Some(other) => Err(ProxyError::Api(ApiError::bad_request(
            code::INVALID_ACTION,
            format!("invalid action: {}", other),
        ))),
        None => Err(ProxyError::Api(ApiError::bad_request(
            code::INVALID_ACTION,
            "missing action parameter",
        ))),
    }
}

fn signed_url_ttl(state: &ProxyState, headers_in: &HeaderMap) -> u64 {
    headers_in
        .get(STREAM_SIGNED_URL_TTL)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(state.config.default_url_ttl_seconds)
}

/// Service-auth only (session management endpoints).
fn require_service_auth(state: &ProxyState, headers_in: &HeaderMap) -> Result<(), ProxyError> {
    match bearer_token(headers_in) {
        Some("") | None => Err(ProxyError::Api(ApiError::unauthorized(
            code::MISSING_SECRET,
            "service credentials required",
        ))),
        Some(token) if token == state.config.secret => Ok(()),
        Some(_) => Err(ProxyError::Api(ApiError::forbidden(
            code::FORBIDDEN,
            "invalid service secret",
        ))),
    }
}

/// Reads accept the service secret or a signed URL.
fn authorize(
    state: &ProxyState,
    id: &str,
    headers_in: &HeaderMap,
    query: &ProxyQuery,
) -> Result<(), ProxyError> {
    if let Some(token) = bearer_token(headers_in) {
        if token.is_empty() {
            return Err(ProxyError::Api(ApiError::unauthorized(
                code::MISSING_SECRET,
                "empty bearer token",
            )));
        }
        if token == state.config.secret {
            return Ok(());
        }
        return Err(ProxyError::Api(ApiError::forbidden(
            code::FORBIDDEN,
            "invalid service secret",
        )));
    }

    let (Some(expires), Some(signature)) = (query.expires.as_deref(), query.signature.as_deref())
    else {
        return Err(ProxyError::Api(ApiError::unauthorized(
            code::MISSING_SIGNATURE,
            "signed url or service credentials required",
        )));
    };
    let expires: i64 = expires.parse().map_err(|_| {
        ProxyError::Api(ApiError::bad_request(
            code::BAD_REQUEST,
            "expires must be a unix timestamp",
        ))
    })?;

    match state
        .signer
        .verify(id, expires, signature, Utc::now().timestamp())
    {
        Ok(()) => Ok(()),
        Err(SignatureError::Expired) => Err(ProxyError::Api(ApiError::unauthorized(
            code::SIGNATURE_EXPIRED,
            format!("signature expired for stream {}", id),
        ))),
        Err(SignatureError::Mismatch) => Err(ProxyError::Api(ApiError::forbidden(
            code::FORBIDDEN,
            "signature mismatch",
        ))),
    }
}

fn bearer_token(headers_in: &HeaderMap) -> Option<&str> {
    headers_in
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(""))
}
