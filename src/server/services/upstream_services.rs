use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use mockall::automock;
use tracing::debug;

use crate::server::error::{AppResult, Error};
use crate::server::utils::http_utils::ProxiedResponse;

pub type DynUpstreamService = Arc<dyn UpstreamServiceTrait + Send + Sync>;

#[automock]
#[async_trait]
pub trait UpstreamServiceTrait {
    /// forward a request to the origin media server and buffer the whole
    /// response. a non-2xx status is NOT an error here, callers decide what
    /// an upstream refusal means for them
    async fn forward(
        &self,
        method: String,
        path_and_query: String,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> AppResult<ProxiedResponse>;
}

pub struct MediaUpstreamService {
    http: reqwest::Client,
    host: String,
}

impl MediaUpstreamService {
    pub fn new(http: reqwest::Client, host: String) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            http,
        }
    }
}

#[async_trait]
impl UpstreamServiceTrait for MediaUpstreamService {
    async fn forward(
        &self,
        method: String,
        path_and_query: String,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> AppResult<ProxiedResponse> {
        let url = format!("{}{}", self.host, path_and_query);
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| Error::MalformedRequest(format!("bad method: {}", method)))?;

        // host and content-length belong to the hop, not the request
        let mut headers = headers;
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        debug!("forwarding {} {}", method, url);

        let response = self
            .http
            .request(method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::UpstreamError {
                status: 502,
                message: format!("origin unreachable: {}", e),
            })?;

        let status = response.status();
        let resp_headers = response.headers().clone();
        let bytes = response.bytes().await.map_err(|e| Error::UpstreamError {
            status: 502,
            message: format!("failed to read origin response: {}", e),
        })?;

        Ok(ProxiedResponse::new(status, resp_headers, bytes.to_vec()))
    }
}
