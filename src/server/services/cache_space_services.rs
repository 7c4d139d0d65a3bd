use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::Extension;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error};

use crate::server::services::bridge_services::BridgeServices;

/// cache space holding the latest PlaybackInfo document per item
pub const PLAYBACK_CACHE_SPACE: &str = "PlaybackInfo";

/// playback documents stay reusable for 12 hours
pub const PLAYBACK_CACHE_TTL_SECONDS: i64 = 12 * 60 * 60;

// handlers don't file their own responses - they tag them with these
// reserved headers and the middleware below does the filing after the fact
pub const HEADER_CACHE_TTL: &str = "x-space-cache-ttl";
pub const HEADER_CACHE_SPACE: &str = "x-space-cache-name";
pub const HEADER_CACHE_KEY: &str = "x-space-cache-key";

/// a ttl of -1 means "this response is served FROM the cache, don't refile it"
pub const CACHE_TTL_SKIP: i64 = -1;

// playback documents are a few hundred kb at worst, anything bigger than
// this is not something we should be buffering
const CACHE_BODY_LIMIT: usize = 16 * 1024 * 1024;

/// the most recent upstream response for one (space, key) pair
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

type Slot = Arc<AsyncMutex<Option<CacheEntry>>>;

/// in-memory keyed store of upstream responses, one slot per (space, key).
///
/// every slot carries its own async mutex: readers that intend to rewrite
/// the entry (the playback-start update) take the slot lock across the whole
/// find-modify-store sequence via `lock`, so two concurrent playback starts
/// for the same item can't stomp each other's update
pub struct CacheSpaceService {
    slots: Mutex<HashMap<(String, String), Slot>>,
}

impl CacheSpaceService {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, space: &str, key: &str) -> Slot {
        let mut slots = self.slots.lock().expect("cache slot map poisoned");
        slots
            .entry((space.to_string(), key.to_string()))
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone()
    }

    /// O(1) lookup, no side effects beyond dropping an entry that expired
    pub async fn get(&self, space: &str, key: &str) -> Option<CacheEntry> {
        let slot = self.slot(space, key);
        let mut guard = slot.lock().await;
        match guard.as_ref() {
            Some(entry) if entry.is_expired() => {
                debug!("cache entry expired, space: {}, key: {}", space, key);
                *guard = None;
                None
            }
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }

    /// establish or replace the entry for a key, at most one entry ever
    /// exists per (space, key)
    pub async fn file(
        &self,
        space: &str,
        key: &str,
        status: StatusCode,
        headers: HeaderMap,
        body: Vec<u8>,
        ttl_seconds: i64,
    ) {
        let slot = self.slot(space, key);
        let mut guard = slot.lock().await;
        debug!(
            "filing cache entry, space: {}, key: {}, {} bytes, ttl {}s",
            space,
            key,
            body.len(),
            ttl_seconds
        );
        *guard = Some(CacheEntry {
            status,
            headers,
            body,
            expires_at: Utc::now() + Duration::seconds(ttl_seconds),
        });
    }

    /// take the per-key lock for a read-modify-write. the guard dereferences
    /// to the optional entry, replacing it in place keeps the swap atomic
    /// for everyone going through `get`
    pub async fn lock(&self, space: &str, key: &str) -> OwnedMutexGuard<Option<CacheEntry>> {
        self.slot(space, key).lock_owned().await
    }
}

impl Default for CacheSpaceService {
    fn default() -> Self {
        Self::new()
    }
}

/// files responses that carry the reserved cache hint headers into the
/// cache space, stripping the hints before anything leaves the process
pub async fn cache_hint_middleware(
    Extension(services): Extension<BridgeServices>,
    req: Request,
    next: Next,
) -> Response {
    let response = next.run(req).await;

    if !response.headers().contains_key(HEADER_CACHE_SPACE) {
        return response;
    }

    let (mut parts, body) = response.into_parts();

    let ttl = parts
        .headers
        .remove(HEADER_CACHE_TTL)
        .and_then(|v| v.to_str().ok().and_then(|s| s.parse::<i64>().ok()));
    let space = parts
        .headers
        .remove(HEADER_CACHE_SPACE)
        .and_then(|v| v.to_str().ok().map(|s| s.to_string()));
    let key = parts
        .headers
        .remove(HEADER_CACHE_KEY)
        .and_then(|v| v.to_str().ok().map(|s| s.to_string()));

    let bytes = match axum::body::to_bytes(body, CACHE_BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("failed to buffer response for cache filing: {}", e);
            return Response::from_parts(parts, Body::empty());
        }
    };

    if let (Some(space), Some(key), Some(ttl)) = (space, key, ttl) {
        // only successful responses are worth reusing, and -1 opts out
        if ttl > 0 && parts.status.is_success() {
            services
                .cache
                .file(
                    &space,
                    &key,
                    parts.status,
                    parts.headers.clone(),
                    bytes.to_vec(),
                    ttl,
                )
                .await;
        }
    }

    Response::from_parts(parts, Body::from(bytes))
}
