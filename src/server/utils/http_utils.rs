use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::server::error::{AppResult, Error};

// inbound bodies are negotiation payloads, not media - cap them hard
const REQUEST_BODY_LIMIT: usize = 4 * 1024 * 1024;

/// a fully buffered upstream response - status, headers, raw body bytes.
/// everything this proxy touches is small (json documents, playlists), so
/// buffering beats streaming here and keeps rewriting simple
#[derive(Debug, Clone)]
pub struct ProxiedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ProxiedResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }
}

/// an inbound request captured for forwarding: method, origin-relative path,
/// the raw (still escaped) query string, headers and buffered body
#[derive(Debug, Clone)]
pub struct ForwardedRequest {
    pub method: String,
    pub path: String,
    pub raw_query: Option<String>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ForwardedRequest {
    pub fn path_and_query(&self) -> String {
        match &self.raw_query {
            Some(q) if !q.is_empty() => format!("{}?{}", self.path, q),
            _ => self.path.clone(),
        }
    }
}

/// buffer an inbound axum request into a forwardable form
pub async fn capture_request(req: Request) -> AppResult<ForwardedRequest> {
    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, REQUEST_BODY_LIMIT)
        .await
        .map_err(|e| Error::MalformedRequest(format!("unreadable request body: {}", e)))?;

    Ok(ForwardedRequest {
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        raw_query: parts.uri.query().map(|q| q.to_string()),
        headers: parts.headers,
        body: bytes.to_vec(),
    })
}

/// turn a buffered upstream response back into an axum response
pub fn proxied_into_response(resp: ProxiedResponse) -> Response {
    (resp.status, resp.headers, resp.body).into_response()
}

/// clone response headers for an outbound response, dropping the ones that
/// stop being true once we've rewritten the body
pub fn clone_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if name == header::CONTENT_LENGTH
            || name == header::TRANSFER_ENCODING
            || name == header::CONNECTION
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// pull one query parameter out of a raw query string WITHOUT decoding it,
/// escaping isn't stable across clients so the verbatim value is what we
/// keep for later comparisons
pub fn raw_query_param(raw_query: &str, name: &str) -> Option<String> {
    raw_query.split('&').find_map(|param| {
        param
            .strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('='))
            .map(|v| v.to_string())
    })
}
