use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::AppConfig;
use crate::server::services::browse_services::BrowseService;
use crate::server::services::cache_space_services::CacheSpaceService;
use crate::server::services::manifest_services::{
    DynManifestFetcher, HttpManifestFetcher, ManifestService,
};
use crate::server::services::playback_services::PlaybackService;
use crate::server::services::storage_services::CloudStorageService;
use crate::server::services::upstream_services::MediaUpstreamService;

use super::{DynStorageService, DynUpstreamService};

/// everything a request handler needs, built once and cloned into the
/// router as an Extension. no database anywhere - all state is in-memory
#[derive(Clone)]
pub struct BridgeServices {
    pub config: Arc<AppConfig>,
    pub http: reqwest::Client,
    pub cache: Arc<CacheSpaceService>,
    pub manifests: Arc<ManifestService>,
    pub storage: DynStorageService,
    pub upstream: DynUpstreamService,
    pub playback: Arc<PlaybackService>,
    pub browse: Arc<BrowseService>,
}

impl BridgeServices {
    pub fn new(config: Arc<AppConfig>) -> Self {
        info!("starting bridge services...");

        // one shared client, every network call inherits this bound so
        // nothing in the proxy can hang forever
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("http client construction");

        let cache = Arc::new(CacheSpaceService::new());

        let storage = Arc::new(CloudStorageService::new(
            http.clone(),
            config.storage_host.clone(),
            config.storage_token.clone(),
        )) as DynStorageService;

        let fetcher =
            Arc::new(HttpManifestFetcher::new(http.clone())) as DynManifestFetcher;
        let manifests = Arc::new(ManifestService::new(fetcher, storage.clone()));

        let upstream = Arc::new(MediaUpstreamService::new(
            http.clone(),
            config.media_host.clone(),
        )) as DynUpstreamService;

        info!("collaborator clients ok, starting core services...");

        let playback = Arc::new(PlaybackService::new(
            config.clone(),
            cache.clone(),
            upstream.clone(),
            storage.clone(),
            manifests.clone(),
        ));

        let browse = Arc::new(BrowseService::new(
            config.clone(),
            cache.clone(),
            upstream.clone(),
        ));

        Self {
            config,
            http,
            cache,
            manifests,
            storage,
            upstream,
            playback,
            browse,
        }
    }
}
