use std::sync::Arc;

use axum::http::{HeaderMap, header};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::server::error::AppResult;
use crate::server::services::cache_space_services::{CacheSpaceService, PLAYBACK_CACHE_SPACE};
use crate::server::services::upstream_services::DynUpstreamService;
use crate::server::utils::http_utils::{ForwardedRequest, ProxiedResponse, clone_headers};
use crate::server::utils::item_resolver::ItemSelector;

/// only items that can actually play get their sources patched
static VALID_ITEM_TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new("(?i)(movie|episode)").expect("static regex"));

/// generic device profile sent when we have to ask for playback info
/// ourselves - claims direct play for the common containers so the origin
/// doesn't bother planning a transcode
pub const PLAYBACK_COMMON_PAYLOAD: &str = r#"{"DeviceProfile":{"MaxStaticBitrate":140000000,"MaxStreamingBitrate":140000000,"DirectPlayProfiles":[{"Container":"mp4,m4v","Type":"Video","VideoCodec":"h264,h265,hevc,av1,vp8,vp9","AudioCodec":"mp3,aac,opus,flac,vorbis"},{"Container":"mkv","Type":"Video","VideoCodec":"h264,h265,hevc,av1,vp8,vp9","AudioCodec":"mp3,aac,opus,flac,vorbis"},{"Container":"mov","Type":"Video","VideoCodec":"h264","AudioCodec":"mp3,aac,opus,flac,vorbis"},{"Container":"mp3","Type":"Audio","AudioCodec":"mp3"},{"Container":"flac","Type":"Audio"}],"TranscodingProfiles":[{"Container":"ts","Type":"Video","AudioCodec":"mp3,aac","VideoCodec":"h264,h265,hevc,av1","Context":"Streaming","Protocol":"hls","MaxAudioChannels":"2","MinSegments":"1","BreakOnNonKeyFrames":true}],"SubtitleProfiles":[{"Format":"vtt","Method":"Hls"},{"Format":"vtt","Method":"External"},{"Format":"ass","Method":"External"},{"Format":"ssa","Method":"External"}]}}"#;

/// overlays the cached/refreshed media-source list onto browse/detail
/// responses, so transcoded preview entries survive independent of the
/// playback-info cache lifetime
pub struct BrowseService {
    config: Arc<AppConfig>,
    cache: Arc<CacheSpaceService>,
    upstream: DynUpstreamService,
}

impl BrowseService {
    pub fn new(
        config: Arc<AppConfig>,
        cache: Arc<CacheSpaceService>,
        upstream: DynUpstreamService,
    ) -> Self {
        Self {
            config,
            cache,
            upstream,
        }
    }

    pub async fn patch_browse_response(
        &self,
        req: ForwardedRequest,
    ) -> AppResult<ProxiedResponse> {
        let upstream = self
            .upstream
            .forward(
                req.method.clone(),
                req.path_and_query(),
                req.headers.clone(),
                req.body.clone(),
            )
            .await?;

        if !upstream.status.is_success() || !self.config.preview_enabled {
            return Ok(upstream);
        }

        let mut doc: Value = match serde_json::from_slice(&upstream.body) {
            Ok(doc) => doc,
            Err(_) => return Ok(upstream),
        };

        let item_type = doc.get("Type").and_then(|v| v.as_str()).unwrap_or("");
        if !VALID_ITEM_TYPE.is_match(item_type) {
            return Ok(upstream);
        }

        let Ok(selector) = ItemSelector::resolve(&req.path, req.raw_query.as_deref()) else {
            return Ok(upstream);
        };

        let mut sources = self.cached_sources(&selector).await;
        if sources.is_none() {
            sources = self.fetch_sources(&selector).await;
        }
        let Some(sources) = sources else {
            // nothing better available, the browse response stays whole even
            // if its source list only offers transcodes
            return Ok(upstream);
        };

        info!(
            "overlaying cached media sources onto browse response, item: {}",
            selector.item_id
        );
        doc["MediaSources"] = sources;

        let body = match serde_json::to_vec(&doc) {
            Ok(body) => body,
            Err(e) => {
                warn!("failed to re-serialize patched browse response: {}", e);
                return Ok(upstream);
            }
        };

        Ok(ProxiedResponse::new(
            upstream.status,
            clone_headers(&upstream.headers),
            body,
        ))
    }

    /// the cached playback document's sources, if any. a present entry that
    /// fails to parse is a different situation than no entry at all - it
    /// gets logged before we fall through to the manual fetch
    async fn cached_sources(&self, selector: &ItemSelector) -> Option<Value> {
        let entry = self.cache.get(PLAYBACK_CACHE_SPACE, &selector.item_id).await?;
        let doc: Value = match serde_json::from_slice(&entry.body) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(
                    "cached playback entry present but unparseable, item: {}: {}",
                    selector.item_id, e
                );
                return None;
            }
        };
        let sources = doc.get("MediaSources")?;
        if !sources.is_array() {
            return None;
        }
        debug!("browse patch served from cache, item: {}", selector.item_id);
        Some(sources.clone())
    }

    /// one manual playback-info request with the generic payload. every
    /// failure mode returns None - availability of the browse response wins
    /// over completeness of its source list
    async fn fetch_sources(&self, selector: &ItemSelector) -> Option<Value> {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "text/plain".parse().ok()?);

        let result = self
            .upstream
            .forward(
                "POST".to_string(),
                selector.playback_info_path.clone(),
                headers,
                PLAYBACK_COMMON_PAYLOAD.as_bytes().to_vec(),
            )
            .await;

        let response = match result {
            Ok(response) if response.status.is_success() => response,
            Ok(response) => {
                warn!(
                    "manual playback info request refused, code: {}, item: {}",
                    response.status, selector.item_id
                );
                return None;
            }
            Err(e) => {
                warn!(
                    "manual playback info request failed, item: {}: {}",
                    selector.item_id, e
                );
                return None;
            }
        };

        let doc: Value = serde_json::from_slice(&response.body).ok()?;
        let sources = doc.get("MediaSources")?;
        if !sources.is_array() {
            return None;
        }
        Some(sources.clone())
    }
}
