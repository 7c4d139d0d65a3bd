use std::sync::Arc;

use axum::http::{HeaderValue, StatusCode, header};
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::server::error::{AppResult, Error};
use crate::server::services::cache_space_services::{
    CacheSpaceService, PLAYBACK_CACHE_SPACE, PLAYBACK_CACHE_TTL_SECONDS,
};
use crate::server::services::manifest_services::ManifestService;
use crate::server::services::storage_services::DynStorageService;
use crate::server::services::upstream_services::DynUpstreamService;
use crate::server::utils::http_utils::{
    ForwardedRequest, ProxiedResponse, clone_headers, raw_query_param,
};
use crate::server::utils::item_resolver::{ItemSelector, SourceSelector, ids_match};

/// where a finished transform wants the surrounding proxy layer to file it
#[derive(Debug, Clone)]
pub struct FilingHint {
    pub space: &'static str,
    pub key: String,
    pub ttl_seconds: i64,
}

/// a transformed response plus its optional cache filing hint
pub struct TransformOutcome {
    pub response: ProxiedResponse,
    pub filing: Option<FilingHint>,
}

/// result of rewriting a single media source. a remote source aborts the
/// whole rewrite, the caller hands back the upstream document untouched
enum SourceOutcome {
    Rewritten { value: Value, base_name: String },
    Halt,
}

/// rewrites PlaybackInfo responses so clients direct-play instead of asking
/// the origin to transcode, and synthesizes transcoded-preview sources from
/// the storage backend's server-side renditions
pub struct PlaybackService {
    config: Arc<AppConfig>,
    cache: Arc<CacheSpaceService>,
    upstream: DynUpstreamService,
    storage: DynStorageService,
    manifests: Arc<ManifestService>,
}

impl PlaybackService {
    pub fn new(
        config: Arc<AppConfig>,
        cache: Arc<CacheSpaceService>,
        upstream: DynUpstreamService,
        storage: DynStorageService,
        manifests: Arc<ManifestService>,
    ) -> Self {
        Self {
            config,
            cache,
            upstream,
            storage,
            manifests,
        }
    }

    /// main entry point for the playback-negotiation endpoint.
    ///
    /// `internal` marks the self-triggered populate request of the cache
    /// reuse cycle - it's a function argument on purpose, a marker arriving
    /// on an outside request is never honored
    pub async fn transform_playback_info(
        &self,
        req: ForwardedRequest,
        internal: bool,
    ) -> AppResult<TransformOutcome> {
        let selector = ItemSelector::resolve(&req.path, req.raw_query.as_deref())?;
        debug!(
            "playback info request, item: {}, source: {:?}, internal: {}",
            selector.item_id, selector.source, internal
        );

        if !internal {
            if let Some(response) = self.use_cached_playback_info(&selector, &req).await? {
                return Ok(TransformOutcome {
                    response,
                    filing: None,
                });
            }
        }

        // no compression negotiation with the origin, we rewrite the body
        let mut fwd_headers = req.headers.clone();
        fwd_headers.remove(header::ACCEPT_ENCODING);
        let upstream = self
            .upstream
            .forward(
                req.method.clone(),
                req.path_and_query(),
                fwd_headers,
                req.body.clone(),
            )
            .await?;

        if !upstream.status.is_success() {
            return Err(Error::UpstreamError {
                status: upstream.status.as_u16(),
                message: String::from_utf8_lossy(&upstream.body).into_owned(),
            });
        }

        let filing = Some(FilingHint {
            space: PLAYBACK_CACHE_SPACE,
            key: selector.item_id.clone(),
            ttl_seconds: PLAYBACK_CACHE_TTL_SECONDS,
        });

        let mut doc: Value = match serde_json::from_slice(&upstream.body) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("upstream playback body is not json: {}", e);
                return Ok(TransformOutcome {
                    response: upstream,
                    filing,
                });
            }
        };

        let sources = doc
            .get("MediaSources")
            .and_then(|v| v.as_array())
            .cloned()
            .filter(|s| !s.is_empty());
        let Some(sources) = sources else {
            info!("no playable media sources, item: {}", selector.item_id);
            return Ok(TransformOutcome {
                response: upstream,
                filing,
            });
        };

        debug!("media sources in document: {}", sources.len());

        let mut rewritten: Vec<Value> = Vec::with_capacity(sources.len());
        let mut slots: Vec<oneshot::Receiver<Vec<Value>>> = Vec::new();

        for source in &sources {
            match self.rewrite_source(&selector, source) {
                SourceOutcome::Halt => {
                    // a remote source can't be direct-linked locally and must
                    // not sit blocked behind its siblings - bail with the
                    // upstream document exactly as it arrived
                    info!("remote media source, passing document through unmodified");
                    return Ok(TransformOutcome {
                        response: ProxiedResponse::new(
                            upstream.status,
                            clone_headers(&upstream.headers),
                            upstream.body.clone(),
                        ),
                        filing,
                    });
                }
                SourceOutcome::Rewritten { value, base_name } => {
                    // previews are only worth synthesizing for full-document
                    // requests and allow-listed containers
                    if selector.source.is_all() && self.config.preview_enabled {
                        let container = source
                            .get("Container")
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        if self.config.container_allowed(container) {
                            let (tx, rx) = oneshot::channel();
                            self.spawn_preview_task(source.clone(), base_name, tx);
                            slots.push(rx);
                        }
                    }
                    rewritten.push(value);
                }
            }
        }

        // drain the result slots in submission order, not completion order,
        // identical requests must produce identically ordered documents
        for rx in slots {
            if let Ok(previews) = rx.await {
                if !previews.is_empty() {
                    info!("appending {} transcoded preview sources", previews.len());
                    rewritten.extend(previews);
                }
            }
        }

        doc["MediaSources"] = Value::Array(rewritten);
        let body = serde_json::to_vec(&doc)
            .map_err(|e| Error::InternalServerErrorWithContext(e.to_string()))?;

        Ok(TransformOutcome {
            response: ProxiedResponse::new(upstream.status, clone_headers(&upstream.headers), body),
            filing,
        })
    }

    /// rewrite one media source for direct play. works on a clone so a halt
    /// leaves the original document byte-identical
    fn rewrite_source(&self, selector: &ItemSelector, source: &Value) -> SourceOutcome {
        let mut source = source.clone();

        // a non-object element has nothing to rewrite, and indexing into it
        // would panic - carry it through verbatim
        if !source.is_object() {
            return SourceOutcome::Rewritten {
                value: source,
                base_name: String::new(),
            };
        }

        // the origin may renumber ids between requests (case, escaping),
        // hand the client back exactly the id it asked with
        if let Some(raw_id) = selector.source.raw_id() {
            source["Id"] = json!(raw_id);
        }

        if source
            .get("IsRemote")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            return SourceOutcome::Halt;
        }

        source["SupportsDirectPlay"] = json!(true);
        source["SupportsDirectStream"] = json!(true);

        let source_id = source
            .get("Id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let direct_url = format!(
            "/videos/{}/stream?MediaSourceId={}&api_key={}&Static=true",
            selector.item_id, source_id, self.config.media_api_key
        );
        debug!("direct stream url set: {}", direct_url);
        source["DirectStreamUrl"] = json!(direct_url);

        let base_name = media_source_display_name(&source);
        source["Name"] = json!(format!("(Original) {}", base_name));

        // the client must not even be offered a transcode
        source["SupportsTranscoding"] = json!(false);
        if let Some(obj) = source.as_object_mut() {
            obj.remove("TranscodingUrl");
            obj.remove("TranscodingSubProtocol");
            obj.remove("TranscodingContainer");
        }

        SourceOutcome::Rewritten {
            value: source,
            base_name,
        }
    }

    /// fire-and-forget synthesis of transcoded-preview sources. the task is
    /// not cancellable and delivers through its private slot only, if the
    /// parent request already returned the result is simply dropped
    fn spawn_preview_task(
        &self,
        source: Value,
        base_name: String,
        tx: oneshot::Sender<Vec<Value>>,
    ) {
        let config = self.config.clone();
        let storage = self.storage.clone();
        let manifests = self.manifests.clone();
        tokio::spawn(async move {
            let previews =
                build_preview_sources(&config, storage, manifests, source, base_name).await;
            let _ = tx.send(previews);
        });
    }

    /// cache reuse as an explicit bounded cycle: try the cache, optionally
    /// run ONE populate pass (a self-request with the source filter
    /// stripped), then try the cache once more and give up
    async fn use_cached_playback_info(
        &self,
        selector: &ItemSelector,
        req: &ForwardedRequest,
    ) -> AppResult<Option<ProxiedResponse>> {
        let mut auto_fetch_all = true;
        loop {
            if let Some(response) = self.try_cached(selector, req).await? {
                return Ok(Some(response));
            }
            // full-document misses never trigger a populate cycle
            if selector.source.is_all() || !auto_fetch_all {
                return Ok(None);
            }
            self.populate_full_document(selector, req).await?;
            auto_fetch_all = false;
        }
    }

    async fn try_cached(
        &self,
        selector: &ItemSelector,
        req: &ForwardedRequest,
    ) -> AppResult<Option<ProxiedResponse>> {
        match &selector.source {
            SourceSelector::All => {
                // fastest path: cached status, headers and bytes verbatim
                match self.cache.get(PLAYBACK_CACHE_SPACE, &selector.item_id).await {
                    Some(entry) => {
                        info!(
                            "reusing cached playback info, item: {}",
                            selector.item_id
                        );
                        Ok(Some(ProxiedResponse::new(
                            entry.status,
                            entry.headers,
                            entry.body,
                        )))
                    }
                    None => Ok(None),
                }
            }
            SourceSelector::Specific(raw_id) => {
                self.match_cached_source(selector, raw_id, req).await
            }
        }
    }

    /// scan the cached document for the requested source. a playback start
    /// additionally rewrites the shared cache entry (matched source first,
    /// stream-index overrides patched across same-item siblings), all under
    /// the per-key lock so concurrent starts serialize
    async fn match_cached_source(
        &self,
        selector: &ItemSelector,
        raw_id: &str,
        req: &ForwardedRequest,
    ) -> AppResult<Option<ProxiedResponse>> {
        let mut guard = self.cache.lock(PLAYBACK_CACHE_SPACE, &selector.item_id).await;
        let Some(entry) = guard.as_mut() else {
            return Ok(None);
        };
        if entry.is_expired() {
            *guard = None;
            return Ok(None);
        }

        let mut doc: Value = match serde_json::from_slice(&entry.body) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("cached playback body failed to parse: {}", e);
                return Ok(None);
            }
        };

        let sources = doc
            .get("MediaSources")
            .and_then(|v| v.as_array())
            .cloned()
            .filter(|s| !s.is_empty());
        let Some(sources) = sources else {
            return Ok(None);
        };

        let Some(idx) = sources.iter().position(|s| {
            s.get("Id")
                .and_then(|v| v.as_str())
                .map(|id| ids_match(id, raw_id))
                .unwrap_or(false)
        }) else {
            return Ok(None);
        };

        let query = req.raw_query.as_deref().unwrap_or("");
        let is_playback = raw_query_param(query, "IsPlayback")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let mut matched = sources[idx].clone();

        if is_playback {
            let audio = raw_query_param(query, "AudioStreamIndex")
                .and_then(|v| v.parse::<i64>().ok());
            let subtitle = raw_query_param(query, "SubtitleStreamIndex")
                .and_then(|v| v.parse::<i64>().ok());

            if let Some(a) = audio {
                matched["DefaultAudioStreamIndex"] = json!(a);
            }
            if let Some(s) = subtitle {
                matched["DefaultSubtitleStreamIndex"] = json!(s);
            }
            let target_item_id = matched
                .get("ItemId")
                .and_then(|v| v.as_str())
                .map(String::from);

            // matched entry moves to the front, siblings of the same item
            // pick up the same overrides, everything else rides along in
            // original order
            let mut reordered = Vec::with_capacity(sources.len());
            reordered.push(matched.clone());
            for (i, other) in sources.iter().enumerate() {
                if i == idx {
                    continue;
                }
                let mut other = other.clone();
                let same_item = target_item_id.is_some()
                    && other.get("ItemId").and_then(|v| v.as_str()).map(String::from)
                        == target_item_id;
                if same_item {
                    if let Some(a) = audio {
                        other["DefaultAudioStreamIndex"] = json!(a);
                    }
                    if let Some(s) = subtitle {
                        other["DefaultSubtitleStreamIndex"] = json!(s);
                    }
                }
                reordered.push(other);
            }
            doc["MediaSources"] = Value::Array(reordered);

            let new_body = serde_json::to_vec(&doc)
                .map_err(|e| Error::InternalServerErrorWithContext(e.to_string()))?;
            entry
                .headers
                .insert(header::CONTENT_LENGTH, HeaderValue::from(new_body.len()));
            entry.body = new_body;
            info!(
                "playback start update applied, item: {}, source: {}",
                selector.item_id, raw_id
            );
        }

        // the response carries ONLY the matched source, updated or not
        doc["MediaSources"] = Value::Array(vec![matched]);
        let body = serde_json::to_vec(&doc)
            .map_err(|e| Error::InternalServerErrorWithContext(e.to_string()))?;
        let headers = clone_headers(&entry.headers);
        Ok(Some(ProxiedResponse::new(StatusCode::OK, headers, body)))
    }

    /// one populate pass: re-run the transform as an internal full-document
    /// request (source filter stripped) and file the result, so the retry
    /// right after can match against a fresh cache entry
    fn populate_full_document<'a>(
        &'a self,
        selector: &'a ItemSelector,
        req: &'a ForwardedRequest,
    ) -> BoxFuture<'a, AppResult<()>> {
        Box::pin(async move {
        info!(
            "no cached match, populating full playback info, item: {}",
            selector.item_id
        );

        let raw_query = req
            .raw_query
            .as_deref()
            .unwrap_or("")
            .split('&')
            .filter(|p| !p.is_empty() && !p.starts_with("MediaSourceId="))
            .collect::<Vec<_>>()
            .join("&");

        let full_req = ForwardedRequest {
            method: req.method.clone(),
            path: selector.playback_info_path.clone(),
            raw_query: (!raw_query.is_empty()).then_some(raw_query),
            headers: req.headers.clone(),
            body: req.body.clone(),
        };

        // boxed to break the transform -> populate -> transform cycle
        let fut: BoxFuture<'_, AppResult<TransformOutcome>> =
            Box::pin(self.transform_playback_info(full_req, true));
        let outcome = fut.await?;

        if let Some(hint) = outcome.filing {
            let response = outcome.response;
            self.cache
                .file(
                    hint.space,
                    &hint.key,
                    response.status,
                    response.headers,
                    response.body,
                    hint.ttl_seconds,
                )
                .await;
        }
        Ok(())
        })
    }
}

/// naming heuristic for the "(Original) ..." label: prefer the video
/// stream's display title, fall back to the source's own name, then the
/// container
fn media_source_display_name(source: &Value) -> String {
    source
        .get("MediaStreams")
        .and_then(|v| v.as_array())
        .and_then(|streams| {
            streams
                .iter()
                .find(|s| s.get("Type").and_then(|t| t.as_str()) == Some("Video"))
                .and_then(|s| s.get("DisplayTitle").and_then(|t| t.as_str()))
                .map(String::from)
        })
        .or_else(|| {
            source
                .get("Name")
                .and_then(|v| v.as_str())
                .filter(|n| !n.is_empty())
                .map(String::from)
        })
        .unwrap_or_else(|| {
            source
                .get("Container")
                .and_then(|v| v.as_str())
                .unwrap_or("stream")
                .to_string()
        })
}

/// build the synthetic transcoded-preview sources for one local source.
/// every failure is swallowed - previews are gravy, never a reason to fail
/// the parent request
async fn build_preview_sources(
    config: &AppConfig,
    storage: DynStorageService,
    manifests: Arc<ManifestService>,
    source: Value,
    base_name: String,
) -> Vec<Value> {
    let Some(path) = source.get("Path").and_then(|v| v.as_str()) else {
        return Vec::new();
    };
    let Some(logical_path) = config.logical_path(path) else {
        debug!("source not under the cloud mount, skipping previews: {}", path);
        return Vec::new();
    };

    let variants = match storage.transcode_variants(logical_path.clone()).await {
        Ok(variants) => variants,
        Err(e) => {
            warn!("transcode listing failed for {}: {}", logical_path, e);
            return Vec::new();
        }
    };

    let raw_id = source
        .get("Id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let mut previews = Vec::with_capacity(variants.len());
    for variant in variants {
        // the provider already handed out a playlist address, park it so the
        // first proxy request skips a resolution round trip
        manifests
            .seed(
                &logical_path,
                &variant.format_id,
                variant.backing_url.clone(),
                variant.subtitles.clone(),
            )
            .await;

        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("logical_path", &logical_path)
            .append_pair("format_id", &variant.format_id)
            .append_pair("api_key", &config.media_api_key)
            .finish();

        let mut preview = source.clone();
        preview["Id"] = json!(format!("{}-{}", raw_id, variant.format_id));
        preview["Name"] = json!(format!("({}) {}", variant.resolution, base_name));
        preview["SupportsDirectPlay"] = json!(false);
        preview["SupportsDirectStream"] = json!(false);
        preview["SupportsTranscoding"] = json!(true);
        preview["TranscodingUrl"] = json!(format!("/videos/proxy_playlist?{}", query));
        preview["TranscodingSubProtocol"] = json!("hls");
        preview["TranscodingContainer"] = json!("ts");
        if let Some(obj) = preview.as_object_mut() {
            obj.remove("DirectStreamUrl");
        }
        previews.push(preview);
    }
    previews
}
