use axum::Router;
use axum::extract::Query;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use tracing::{debug, error};

use crate::server::error::{AppResult, Error};
use crate::server::extractors::ApiKeyAuthentication;

const M3U8_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

#[derive(Deserialize)]
struct PlaylistQuery {
    logical_path: String,
    format_id: String,
    /// "main" asks for the nested segment playlist of a subtitled stream
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Deserialize)]
struct SegmentQuery {
    logical_path: String,
    format_id: String,
    idx: usize,
}

#[derive(Deserialize)]
struct SubtitleQuery {
    logical_path: String,
    format_id: String,
    idx: usize,
}

pub struct ManifestController;

impl ManifestController {
    pub fn app() -> Router {
        Router::new()
            .route("/videos/proxy_playlist", get(Self::proxy_playlist))
            .route("/videos/proxy_ts", get(Self::proxy_ts))
            .route("/videos/proxy_subtitle", get(Self::proxy_subtitle))
    }

    /// serve the locally proxied playlist rendering, refreshing the backing
    /// manifest first when stale. the backing url never appears in here
    async fn proxy_playlist(
        ApiKeyAuthentication(services): ApiKeyAuthentication,
        Query(params): Query<PlaylistQuery>,
    ) -> AppResult<Response> {
        let manifest = services
            .manifests
            .fresh(&params.logical_path, &params.format_id)
            .await?;

        let want_main = params.kind.as_deref() == Some("main");
        let body = manifest.render_local_proxy(want_main, &services.config.media_api_key);
        debug!(
            "serving proxied playlist, logical_path: {}, main: {}, {} bytes",
            params.logical_path,
            want_main,
            body.len()
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            M3U8_CONTENT_TYPE
                .parse()
                .expect("Static header value should parse"),
        );
        headers.insert(
            header::CACHE_CONTROL,
            "no-cache".parse().expect("Static header value should parse"),
        );

        Ok((StatusCode::OK, headers, body).into_response())
    }

    /// relay one segment's bytes from the backing address, server side, so
    /// the provider credentials in the url stay out of client hands
    async fn proxy_ts(
        ApiKeyAuthentication(services): ApiKeyAuthentication,
        Query(params): Query<SegmentQuery>,
    ) -> AppResult<Response> {
        let link = {
            let manifest = services
                .manifests
                .fresh(&params.logical_path, &params.format_id)
                .await?;
            manifest.segment_link(params.idx).ok_or_else(|| {
                Error::MalformedRequest(format!("segment index out of range: {}", params.idx))
            })?
            // guard drops here, the fetch shouldn't hold the manifest lock
        };

        let bytes = Self::relay(&services.http, &link).await?;

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            "video/mp2t".parse().expect("Static header value should parse"),
        );
        // segments are immutable once cut
        headers.insert(
            header::CACHE_CONTROL,
            "public, max-age=31536000"
                .parse()
                .expect("Static header value should parse"),
        );

        Ok((StatusCode::OK, headers, bytes).into_response())
    }

    /// relay one subtitle rendition, same credential-hiding deal as segments
    async fn proxy_subtitle(
        ApiKeyAuthentication(services): ApiKeyAuthentication,
        Query(params): Query<SubtitleQuery>,
    ) -> AppResult<Response> {
        let link = {
            let manifest = services
                .manifests
                .fresh(&params.logical_path, &params.format_id)
                .await?;
            manifest
                .subtitle_track(params.idx)
                .map(|track| track.url.clone())
                .ok_or_else(|| {
                    Error::MalformedRequest(format!(
                        "subtitle index out of range: {}",
                        params.idx
                    ))
                })?
        };

        let bytes = Self::relay(&services.http, &link).await?;

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            M3U8_CONTENT_TYPE
                .parse()
                .expect("Static header value should parse"),
        );

        Ok((StatusCode::OK, headers, bytes).into_response())
    }

    async fn relay(http: &reqwest::Client, url: &str) -> AppResult<Vec<u8>> {
        let response = http.get(url).send().await.map_err(|e| {
            error!("backing fetch failed: {}", e);
            Error::UpstreamError {
                status: 502,
                message: format!("backing fetch failed: {}", e),
            }
        })?;

        if !response.status().is_success() {
            return Err(Error::UpstreamError {
                status: response.status().as_u16(),
                message: format!("backing fetch returned {}", response.status()),
            });
        }

        let bytes = response.bytes().await.map_err(|e| Error::UpstreamError {
            status: 502,
            message: format!("failed to read backing response: {}", e),
        })?;
        Ok(bytes.to_vec())
    }
}
