//! Upstream request assembly and dispatch.

use axum::http::{header, HeaderMap, HeaderName, Method};
use bytes::Bytes;
use url::Url;

use super::{allowlist::Allowlist, ProxyError};

/// Control headers consumed by the proxy itself.
const UPSTREAM_URL: &str = "upstream-url";
const UPSTREAM_METHOD: &str = "upstream-method";

/// Hop-by-hop and proxy-control headers that are never forwarded.
const STRIPPED: &[&str] = &[
    "proxy-authenticate",
    "proxy-authorization",
    "trailers",
    "stream-signed-url-ttl",
    "renew-stream-url",
    "connection",
    "keep-alive",
    "te",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// A validated upstream request, ready to send.
#[derive(Debug)]
pub struct ForwardSpec {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

/// Extract and validate the upstream request from a proxy call.
///
/// `Upstream-Url` and `Upstream-Method` are required; every other
/// `Upstream-<Name>` header is forwarded to the upstream as `<Name>`,
/// minus the stripped set.
pub fn forward_spec(headers_in: &HeaderMap, allowlist: &Allowlist) -> Result<ForwardSpec, ProxyError> {
    let raw_url = headers_in
        .get(UPSTREAM_URL)
        .and_then(|v| v.to_str().ok())
        .ok_or(ProxyError::MissingUpstreamUrl)?;
    let url = allowlist.check(raw_url)?;

    let raw_method = headers_in
        .get(UPSTREAM_METHOD)
        .and_then(|v| v.to_str().ok())
        .ok_or(ProxyError::MissingUpstreamMethod)?;
    let method = parse_method(raw_method)?;

    let mut headers = HeaderMap::new();
    for (name, value) in headers_in.iter() {
        let name = name.as_str();
        let Some(forwarded) = name.strip_prefix("upstream-") else {
            continue;
        };
        if name == UPSTREAM_URL || name == UPSTREAM_METHOD {
            continue;
        }
        if STRIPPED.contains(&forwarded) {
            continue;
        }
        if let Ok(forwarded) = HeaderName::from_bytes(forwarded.as_bytes()) {
            headers.append(forwarded, value.clone());
        }
    }
    // The upstream body's content type rides on the standard header.
    if let Some(ct) = headers_in.get(header::CONTENT_TYPE) {
        headers.entry(header::CONTENT_TYPE).or_insert(ct.clone());
    }

    Ok(ForwardSpec {
        method,
        url,
        headers,
    })
}

fn parse_method(raw: &str) -> Result<Method, ProxyError> {
    match raw.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        "HEAD" => Ok(Method::HEAD),
        other => Err(ProxyError::InvalidUpstreamMethod(other.to_string())),
    }
}

/// Build the shared upstream client. Redirects are surfaced, never
/// followed.
pub fn build_client() -> Result<reqwest::Client, ProxyError> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| ProxyError::Unreachable(e.to_string()))
}

/// Send the upstream request and classify the response: 3xx is
/// rejected, non-2xx is surfaced as an upstream error with its body.
pub async fn send(
    client: &reqwest::Client,
    spec: ForwardSpec,
    body: Bytes,
) -> Result<reqwest::Response, ProxyError> {
    let response = client
        .request(spec.method, spec.url)
        .headers(spec.headers)
        .body(body)
        .send()
        .await
        .map_err(|e| ProxyError::Unreachable(e.to_string()))?;

    let status = response.status();
    if status.is_redirection() {
        return Err(ProxyError::Redirect);
    }
    if !status.is_success() {
        let body = response.bytes().await.unwrap_or_default();
        return Err(ProxyError::UpstreamStatus {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}
