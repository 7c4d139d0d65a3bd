use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockall::automock;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::server::error::{AppResult, Error};
use crate::server::services::storage_services::{
    DynStorageService, StorageServiceTrait, SubtitleTrack,
};

/// content types a remote playlist response is allowed to declare
const RECOGNIZED_MANIFEST_TYPES: &[&str] = &[
    "application/vnd.apple.mpegurl",
    "application/x-mpegurl",
    "audio/x-mpegurl",
    "audio/mpegurl",
    "video/x-mpegurl",
    "application/octet-stream",
];

/// where a playlist directive belongs once parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectivePlacement {
    /// document-level, expected once near the top
    Head,
    /// document-level, after the last segment
    Tail,
    /// rides with the next segment line
    SegmentAttached,
}

/// closed mapping from directive tag to placement. anything not named here
/// is attached to the following segment and passed through uninterpreted
pub fn classify_directive(tag: &str) -> DirectivePlacement {
    match tag {
        "#EXTM3U" | "#EXT-X-VERSION" | "#EXT-X-TARGETDURATION" | "#EXT-X-MEDIA-SEQUENCE"
        | "#EXT-X-PLAYLIST-TYPE" | "#EXT-X-ALLOW-CACHE" => DirectivePlacement::Head,
        "#EXT-X-ENDLIST" => DirectivePlacement::Tail,
        _ => DirectivePlacement::SegmentAttached,
    }
}

pub type DynManifestFetcher = Arc<dyn ManifestFetcher + Send + Sync>;

#[automock]
#[async_trait]
pub trait ManifestFetcher {
    /// GET a url, returning (declared content type, body bytes)
    async fn fetch(&self, url: String) -> AppResult<(String, Vec<u8>)>;
}

pub struct HttpManifestFetcher {
    http: reqwest::Client,
}

impl HttpManifestFetcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ManifestFetcher for HttpManifestFetcher {
    async fn fetch(&self, url: String) -> AppResult<(String, Vec<u8>)> {
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::UpstreamError {
                status: 502,
                message: format!("backing fetch failed: {}", e),
            })?;

        if !response.status().is_success() {
            return Err(Error::UpstreamError {
                status: response.status().as_u16(),
                message: format!("backing fetch returned {}", response.status()),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let bytes = response.bytes().await.map_err(|e| Error::UpstreamError {
            status: 502,
            message: format!("failed to read backing response: {}", e),
        })?;

        Ok((content_type, bytes.to_vec()))
    }
}

/// one segment line plus the directive lines that sat right above it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRef {
    pub relative_url: String,
    pub preceding_directives: Vec<String>,
}

/// a parsed chunked-list playlist tied to its rotating backing address.
///
/// the (logical_path, format_id) pair is the stable identity clients see,
/// the backing url and segment set underneath it rotate on refresh
#[derive(Debug, Clone)]
pub struct MediaManifest {
    pub remote_base: String,
    pub head_directives: Vec<String>,
    pub tail_directives: Vec<String>,
    pub segments: Vec<SegmentRef>,
    pub subtitles: Vec<SubtitleTrack>,
    pub logical_path: String,
    pub format_id: String,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    /// one-shot backing address consumed by the next refresh, set when the
    /// url is already known fresh (right after preview synthesis)
    pub pending_backing_url: Option<String>,
}

impl MediaManifest {
    pub fn new(logical_path: String, format_id: String) -> Self {
        Self {
            remote_base: String::new(),
            head_directives: Vec::new(),
            tail_directives: Vec::new(),
            segments: Vec::new(),
            subtitles: Vec::new(),
            logical_path,
            format_id,
            last_refreshed_at: None,
            pending_backing_url: None,
        }
    }

    /// parse playlist text line by line. segment lines prefixed with
    /// base_url are stored base-relative, directives are routed by the
    /// closed placement mapping, everything else is kept verbatim
    pub fn parse(base_url: &str, text: &str) -> Self {
        let mut manifest = Self::new(String::new(), String::new());
        manifest.remote_base = base_url.to_string();

        let mut buffered: Vec<String> = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if !line.starts_with('#') {
                let mut relative = line.to_string();
                if let Some(rest) = relative.strip_prefix(base_url) {
                    relative = rest.trim_start_matches('/').to_string();
                }
                manifest.segments.push(SegmentRef {
                    relative_url: relative,
                    preceding_directives: std::mem::take(&mut buffered),
                });
                continue;
            }

            let tag = line.split(':').next().unwrap_or(line);
            match classify_directive(tag) {
                DirectivePlacement::Head => manifest.head_directives.push(line.to_string()),
                DirectivePlacement::Tail => manifest.tail_directives.push(line.to_string()),
                DirectivePlacement::SegmentAttached => buffered.push(line.to_string()),
            }
        }

        manifest
    }

    /// fetch a remote playlist and parse it. the base is the url truncated
    /// at the last path separator before any query string
    pub async fn fetch_remote(fetcher: &(dyn ManifestFetcher + Send + Sync), url: &str) -> AppResult<Self> {
        let query_pos = url.find('?').unwrap_or(url.len());
        let last_sep = url[..query_pos]
            .rfind('/')
            .ok_or_else(|| Error::InvalidAddress(url.to_string()))?;
        let base_url = &url[..last_sep + 1];

        let (content_type, body) = fetcher.fetch(url.to_string()).await?;

        let declared = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if !RECOGNIZED_MANIFEST_TYPES.contains(&declared.as_str()) {
            return Err(Error::UnexpectedContentType(content_type));
        }

        let text = String::from_utf8(body)
            .map_err(|e| Error::MalformedManifest(format!("not utf-8: {}", e)))?;

        Ok(Self::parse(base_url, &text))
    }

    /// absolute backing address for one segment
    pub fn segment_link(&self, idx: usize) -> Option<String> {
        self.segments
            .get(idx)
            .map(|seg| format!("{}{}", self.remote_base, seg.relative_url))
    }

    pub fn subtitle_track(&self, idx: usize) -> Option<&SubtitleTrack> {
        self.subtitles.get(idx)
    }

    fn proxy_query(&self, api_key: &str, extra: &[(&str, String)]) -> String {
        let mut ser = url::form_urlencoded::Serializer::new(String::new());
        ser.append_pair("logical_path", &self.logical_path);
        ser.append_pair("format_id", &self.format_id);
        for (k, v) in extra {
            ser.append_pair(k, v);
        }
        ser.append_pair("api_key", api_key);
        ser.finish()
    }

    /// re-serialize with segment urls resolved to absolute form, exact
    /// directive placement and ordering preserved
    pub fn render_absolute(&self) -> String {
        let mut lines: Vec<String> = Vec::new();
        lines.extend(self.head_directives.iter().cloned());
        for seg in &self.segments {
            lines.extend(seg.preceding_directives.iter().cloned());
            lines.push(format!("{}{}", self.remote_base, seg.relative_url));
        }
        lines.extend(self.tail_directives.iter().cloned());
        lines.join("\n")
    }

    /// locally proxied rendering - segment lines become /videos/proxy_ts
    /// urls so the backing address and its credentials never leave the
    /// server. when the stream carries subtitles (and the caller didn't ask
    /// for the nested main playlist) a variant playlist is emitted instead,
    /// because subtitle group declarations live one level above segment data
    pub fn render_local_proxy(&self, want_main: bool, api_key: &str) -> String {
        if !want_main && !self.subtitles.is_empty() {
            let mut lines: Vec<String> = vec!["#EXTM3U".to_string(), "#EXT-X-VERSION:3".to_string()];
            for (idx, track) in self.subtitles.iter().enumerate() {
                let query = self.proxy_query(api_key, &[("idx", idx.to_string())]);
                lines.push(format!(
                    "#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"subs\",NAME=\"{}\",LANGUAGE=\"{}\",URI=\"/videos/proxy_subtitle?{}\"",
                    track.language, track.language, query
                ));
            }
            let main_query = self.proxy_query(api_key, &[("type", "main".to_string())]);
            lines.push("#EXT-X-STREAM-INF:SUBTITLES=\"subs\"".to_string());
            lines.push(format!("/videos/proxy_playlist?{}", main_query));
            return lines.join("\n");
        }

        let mut lines: Vec<String> = Vec::new();
        lines.extend(self.head_directives.iter().cloned());
        for (idx, seg) in self.segments.iter().enumerate() {
            lines.extend(seg.preceding_directives.iter().cloned());
            let query = self.proxy_query(api_key, &[("idx", idx.to_string())]);
            lines.push(format!("/videos/proxy_ts?{}", query));
        }
        lines.extend(self.tail_directives.iter().cloned());
        lines.join("\n")
    }

    pub fn is_stale(&self, stale_after_seconds: i64) -> bool {
        match self.last_refreshed_at {
            None => true,
            Some(at) => {
                self.segments.is_empty()
                    || (Utc::now() - at).num_seconds() > stale_after_seconds
            }
        }
    }

    /// re-resolve the rotating backing address and swap in the freshly
    /// parsed playlist wholesale. a pending backing url (already known
    /// fresh) is consumed instead of a resolution round trip, once
    pub async fn refresh(
        &mut self,
        fetcher: &(dyn ManifestFetcher + Send + Sync),
        storage: &(dyn StorageServiceTrait + Send + Sync),
    ) -> AppResult<()> {
        if self.logical_path.is_empty() || self.format_id.is_empty() {
            return Err(Error::MissingIdentity);
        }

        debug!(
            "refreshing playlist, logical_path: {}, format_id: {}",
            self.logical_path, self.format_id
        );

        let fresh = match self.pending_backing_url.take() {
            Some(pending) => MediaManifest::fetch_remote(fetcher, &pending).await?,
            None => {
                let resource = storage
                    .resolve(self.logical_path.clone(), Some(self.format_id.clone()), true)
                    .await?;
                let parsed = MediaManifest::fetch_remote(fetcher, &resource.url).await?;
                self.subtitles = resource.subtitles;
                parsed
            }
        };

        self.remote_base = fresh.remote_base;
        self.head_directives = fresh.head_directives;
        self.tail_directives = fresh.tail_directives;
        self.segments = fresh.segments;
        self.last_refreshed_at = Some(Utc::now());

        info!(
            "playlist refreshed, logical_path: {}, format_id: {}, {} segments",
            self.logical_path,
            self.format_id,
            self.segments.len()
        );
        Ok(())
    }
}

type ManifestSlot = Arc<AsyncMutex<MediaManifest>>;

/// registry of live manifests keyed by their stable identity. each entry
/// sits behind its own async mutex so refresh-and-render sequences don't
/// interleave for the same stream
pub struct ManifestService {
    manifests: Mutex<HashMap<(String, String), ManifestSlot>>,
    fetcher: DynManifestFetcher,
    storage: DynStorageService,
    stale_after_seconds: i64,
}

/// refreshing more often than this is wasted round trips, the backing
/// providers rotate on the order of minutes
const DEFAULT_STALE_AFTER_SECONDS: i64 = 300;

impl ManifestService {
    pub fn new(fetcher: DynManifestFetcher, storage: DynStorageService) -> Self {
        Self {
            manifests: Mutex::new(HashMap::new()),
            fetcher,
            storage,
            stale_after_seconds: DEFAULT_STALE_AFTER_SECONDS,
        }
    }

    fn entry(&self, logical_path: &str, format_id: &str) -> ManifestSlot {
        let mut manifests = self.manifests.lock().expect("manifest map poisoned");
        manifests
            .entry((logical_path.to_string(), format_id.to_string()))
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(MediaManifest::new(
                    logical_path.to_string(),
                    format_id.to_string(),
                )))
            })
            .clone()
    }

    /// register (or re-register) a stream with a backing url that is known
    /// fresh, so the first playlist request skips a resolution round trip
    pub async fn seed(
        &self,
        logical_path: &str,
        format_id: &str,
        backing_url: Option<String>,
        subtitles: Vec<SubtitleTrack>,
    ) {
        let slot = self.entry(logical_path, format_id);
        let mut manifest = slot.lock().await;
        manifest.pending_backing_url = backing_url;
        manifest.subtitles = subtitles;
    }

    /// lock the manifest for this identity, refreshing it first if stale
    pub async fn fresh(
        &self,
        logical_path: &str,
        format_id: &str,
    ) -> AppResult<OwnedMutexGuard<MediaManifest>> {
        let slot = self.entry(logical_path, format_id);
        let mut guard = slot.lock_owned().await;
        if guard.is_stale(self.stale_after_seconds) {
            guard
                .refresh(self.fetcher.as_ref(), self.storage.as_ref())
                .await?;
        }
        Ok(guard)
    }
}
