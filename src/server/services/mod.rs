pub mod bridge_services;
pub mod browse_services;
pub mod cache_space_services;
pub mod manifest_services;
pub mod playback_services;
pub mod storage_services;
pub mod upstream_services;

pub use bridge_services::BridgeServices;
pub use manifest_services::DynManifestFetcher;
pub use storage_services::DynStorageService;
pub use upstream_services::DynUpstreamService;
