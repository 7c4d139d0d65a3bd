use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode, header};
use serde_json::{Value, json};

use bridge::AppConfig;
use bridge::server::services::cache_space_services::CacheSpaceService;
use bridge::server::services::manifest_services::{DynManifestFetcher, ManifestService, MockManifestFetcher};
use bridge::server::services::playback_services::PlaybackService;
use bridge::server::services::storage_services::{
    DynStorageService, MockStorageServiceTrait, TranscodeVariant,
};
use bridge::server::services::upstream_services::{DynUpstreamService, MockUpstreamServiceTrait};
use bridge::server::utils::http_utils::{ForwardedRequest, ProxiedResponse};

fn build_service(
    config: AppConfig,
    upstream: MockUpstreamServiceTrait,
    storage: MockStorageServiceTrait,
) -> (PlaybackService, Arc<CacheSpaceService>) {
    let config = Arc::new(config);
    let cache = Arc::new(CacheSpaceService::new());
    let storage = Arc::new(storage) as DynStorageService;
    let manifests = Arc::new(ManifestService::new(
        Arc::new(MockManifestFetcher::new()) as DynManifestFetcher,
        storage.clone(),
    ));
    let service = PlaybackService::new(
        config,
        cache.clone(),
        Arc::new(upstream) as DynUpstreamService,
        storage,
        manifests,
    );
    (service, cache)
}

fn request(path: &str, raw_query: Option<&str>) -> ForwardedRequest {
    ForwardedRequest {
        method: "POST".to_string(),
        path: path.to_string(),
        raw_query: raw_query.map(|q| q.to_string()),
        headers: HeaderMap::new(),
        body: Vec::new(),
    }
}

fn json_response(doc: &Value) -> ProxiedResponse {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
    ProxiedResponse::new(
        StatusCode::OK,
        headers,
        serde_json::to_vec(doc).unwrap(),
    )
}

fn local_source(id: &str, item_id: &str) -> Value {
    json!({
        "Id": id,
        "ItemId": item_id,
        "Container": "mkv",
        "Path": "/mnt/cloud/movie.mkv",
        "IsRemote": false,
        "SupportsDirectPlay": false,
        "SupportsDirectStream": false,
        "SupportsTranscoding": true,
        "TranscodingUrl": "/videos/12345/master.m3u8",
        "TranscodingSubProtocol": "hls",
        "Name": "original name",
        "MediaStreams": [{"Type": "Video", "DisplayTitle": "1080p HEVC"}]
    })
}

fn no_preview_config() -> AppConfig {
    AppConfig {
        preview_enabled: false,
        ..AppConfig::default()
    }
}

#[tokio::test]
async fn test_local_source_is_rewritten_for_direct_play() {
    let doc = json!({"MediaSources": [local_source("src1", "12345")], "PlaySessionId": "ps1"});

    let mut upstream = MockUpstreamServiceTrait::new();
    upstream
        .expect_forward()
        .times(1)
        .returning(move |_, _, _, _| Ok(json_response(&doc)));

    let (service, _cache) =
        build_service(no_preview_config(), upstream, MockStorageServiceTrait::new());

    let outcome = service
        .transform_playback_info(request("/Items/12345/PlaybackInfo", None), false)
        .await
        .unwrap();

    let body: Value = serde_json::from_slice(&outcome.response.body).unwrap();
    let source = &body["MediaSources"][0];

    assert_eq!(source["SupportsDirectPlay"], json!(true));
    assert_eq!(source["SupportsDirectStream"], json!(true));
    assert_eq!(
        source["DirectStreamUrl"],
        json!("/videos/12345/stream?MediaSourceId=src1&api_key=default-api-key&Static=true")
    );
    assert_eq!(source["Name"], json!("(Original) 1080p HEVC"));
    assert_eq!(source["SupportsTranscoding"], json!(false));
    assert!(source.get("TranscodingUrl").is_none());
    assert!(source.get("TranscodingSubProtocol").is_none());

    // the rest of the document rides along untouched
    assert_eq!(body["PlaySessionId"], json!("ps1"));

    let filing = outcome.filing.unwrap();
    assert_eq!(filing.space, "PlaybackInfo");
    assert_eq!(filing.key, "12345");
    assert_eq!(filing.ttl_seconds, 12 * 60 * 60);
}

#[tokio::test]
async fn test_remote_source_passes_the_document_through_unmodified() {
    let doc = json!({"MediaSources": [
        local_source("src1", "12345"),
        {"Id": "src2", "ItemId": "12345", "IsRemote": true, "Container": "mkv"}
    ]});
    let original_bytes = serde_json::to_vec(&doc).unwrap();
    let expected = original_bytes.clone();

    let mut upstream = MockUpstreamServiceTrait::new();
    upstream.expect_forward().times(1).returning(move |_, _, _, _| {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        headers.insert(header::CONTENT_LENGTH, original_bytes.len().into());
        Ok(ProxiedResponse::new(
            StatusCode::OK,
            headers,
            original_bytes.clone(),
        ))
    });

    let (service, _cache) =
        build_service(no_preview_config(), upstream, MockStorageServiceTrait::new());

    let outcome = service
        .transform_playback_info(request("/Items/12345/PlaybackInfo", None), false)
        .await
        .unwrap();

    // byte-identical body, even the local sibling stays untouched
    assert_eq!(outcome.response.body, expected);
    // content-length no longer vouches for anything once we've buffered
    assert!(outcome.response.headers.get(header::CONTENT_LENGTH).is_none());
    assert!(outcome.filing.is_some());
}

#[tokio::test]
async fn test_cached_full_document_skips_the_origin_entirely() {
    let cached = serde_json::to_vec(&json!({"MediaSources": [local_source("src1", "12345")]}))
        .unwrap();

    // no forward expectations: any origin call fails the test
    let upstream = MockUpstreamServiceTrait::new();
    let (service, cache) =
        build_service(no_preview_config(), upstream, MockStorageServiceTrait::new());

    cache
        .file(
            "PlaybackInfo",
            "12345",
            StatusCode::OK,
            HeaderMap::new(),
            cached.clone(),
            3600,
        )
        .await;

    let outcome = service
        .transform_playback_info(request("/Items/12345/PlaybackInfo", None), false)
        .await
        .unwrap();

    assert_eq!(outcome.response.body, cached);
    // served from cache, nothing to refile
    assert!(outcome.filing.is_none());
}

#[tokio::test]
async fn test_playback_start_reorders_and_patches_the_cached_document() {
    let cached = json!({"MediaSources": [
        local_source("src-x", "12345"),
        local_source("src-y", "12345"),
        local_source("src-z", "99999"),
    ]});

    let upstream = MockUpstreamServiceTrait::new();
    let (service, cache) =
        build_service(no_preview_config(), upstream, MockStorageServiceTrait::new());

    cache
        .file(
            "PlaybackInfo",
            "12345",
            StatusCode::OK,
            HeaderMap::new(),
            serde_json::to_vec(&cached).unwrap(),
            3600,
        )
        .await;

    let outcome = service
        .transform_playback_info(
            request(
                "/Items/12345/PlaybackInfo",
                Some("MediaSourceId=src-y&IsPlayback=true&AudioStreamIndex=2&SubtitleStreamIndex=5"),
            ),
            false,
        )
        .await
        .unwrap();

    // the response carries only the matched source, with overrides applied
    let body: Value = serde_json::from_slice(&outcome.response.body).unwrap();
    let sources = body["MediaSources"].as_array().unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0]["Id"], json!("src-y"));
    assert_eq!(sources[0]["DefaultAudioStreamIndex"], json!(2));
    assert_eq!(sources[0]["DefaultSubtitleStreamIndex"], json!(5));

    // the shared entry got rewritten: matched first, same-item sibling
    // patched, the unrelated source untouched in its original position
    let entry = cache.get("PlaybackInfo", "12345").await.unwrap();
    let stored: Value = serde_json::from_slice(&entry.body).unwrap();
    let stored_sources = stored["MediaSources"].as_array().unwrap();
    assert_eq!(stored_sources.len(), 3);
    assert_eq!(stored_sources[0]["Id"], json!("src-y"));
    assert_eq!(stored_sources[1]["Id"], json!("src-x"));
    assert_eq!(stored_sources[2]["Id"], json!("src-z"));
    assert_eq!(stored_sources[1]["DefaultAudioStreamIndex"], json!(2));
    assert!(stored_sources[2].get("DefaultAudioStreamIndex").is_none());
}

#[tokio::test]
async fn test_specific_source_miss_runs_one_populate_pass() {
    let doc = json!({"MediaSources": [local_source("src1", "12345")]});

    let mut upstream = MockUpstreamServiceTrait::new();
    // exactly one origin round trip, and it must be the full-document form
    upstream
        .expect_forward()
        .withf(|_, path_and_query, _, _| !path_and_query.contains("MediaSourceId"))
        .times(1)
        .returning(move |_, _, _, _| Ok(json_response(&doc)));

    let (service, cache) =
        build_service(no_preview_config(), upstream, MockStorageServiceTrait::new());

    let outcome = service
        .transform_playback_info(
            request("/Items/12345/PlaybackInfo", Some("MediaSourceId=src1")),
            false,
        )
        .await
        .unwrap();

    let body: Value = serde_json::from_slice(&outcome.response.body).unwrap();
    let sources = body["MediaSources"].as_array().unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0]["Id"], json!("src1"));
    // the populate pass already rewrote it for direct play
    assert_eq!(sources[0]["SupportsDirectPlay"], json!(true));

    // and the full document is now cached for the next client
    assert!(cache.get("PlaybackInfo", "12345").await.is_some());
}

#[tokio::test]
async fn test_requested_source_id_is_restored_verbatim() {
    // the origin hands back "src-1" but the client asked with an escaped,
    // differently-cased id. the populate pass can't match it, so the second
    // round trip rewrites the document and must restore the id exactly as
    // the client sent it
    let doc = json!({"MediaSources": [local_source("src-1", "12345")]});

    let mut upstream = MockUpstreamServiceTrait::new();
    upstream
        .expect_forward()
        .times(2)
        .returning(move |_, _, _, _| Ok(json_response(&doc)));

    let (service, _cache) =
        build_service(no_preview_config(), upstream, MockStorageServiceTrait::new());

    let outcome = service
        .transform_playback_info(
            request("/Items/12345/PlaybackInfo", Some("MediaSourceId=Src%2D1")),
            false,
        )
        .await
        .unwrap();

    let body: Value = serde_json::from_slice(&outcome.response.body).unwrap();
    let sources = body["MediaSources"].as_array().unwrap();
    assert_eq!(sources.len(), 1);

    // verbatim: still escaped, original casing, not the upstream spelling
    assert_eq!(sources[0]["Id"], json!("Src%2D1"));
    assert!(
        sources[0]["DirectStreamUrl"]
            .as_str()
            .unwrap()
            .contains("MediaSourceId=Src%2D1")
    );
}

#[tokio::test]
async fn test_non_object_source_entries_ride_along_unrewritten() {
    // a malformed element in the list must not take the request down
    let doc = json!({"MediaSources": ["garbage", local_source("src1", "12345")]});

    let mut upstream = MockUpstreamServiceTrait::new();
    upstream
        .expect_forward()
        .times(1)
        .returning(move |_, _, _, _| Ok(json_response(&doc)));

    let (service, _cache) =
        build_service(no_preview_config(), upstream, MockStorageServiceTrait::new());

    let outcome = service
        .transform_playback_info(request("/Items/12345/PlaybackInfo", None), false)
        .await
        .unwrap();

    let body: Value = serde_json::from_slice(&outcome.response.body).unwrap();
    let sources = body["MediaSources"].as_array().unwrap();
    assert_eq!(sources.len(), 2);
    assert_eq!(sources[0], json!("garbage"));
    assert_eq!(sources[1]["SupportsDirectPlay"], json!(true));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_preview_collection_order_survives_out_of_order_completion() {
    let mut first = local_source("src-a", "12345");
    first["Path"] = json!("/mnt/cloud/a.mkv");
    let mut second = local_source("src-b", "12345");
    second["Path"] = json!("/mnt/cloud/b.mkv");
    let doc = json!({"MediaSources": [first, second]});

    let mut upstream = MockUpstreamServiceTrait::new();
    upstream
        .expect_forward()
        .times(1)
        .returning(move |_, _, _, _| Ok(json_response(&doc)));

    let variant = |resolution: &str| TranscodeVariant {
        format_id: "FHD".to_string(),
        resolution: resolution.to_string(),
        backing_url: None,
        subtitles: Vec::new(),
    };

    let mut storage = MockStorageServiceTrait::new();
    // the first source's listing drags its feet, the second finishes right
    // away - the appended order must still follow the source order
    let slow = variant("1080p");
    storage
        .expect_transcode_variants()
        .withf(|path| path.as_str() == "/a.mkv")
        .times(1)
        .returning(move |_| {
            std::thread::sleep(std::time::Duration::from_millis(100));
            Ok(vec![slow.clone()])
        });
    let fast = variant("1080p");
    storage
        .expect_transcode_variants()
        .withf(|path| path.as_str() == "/b.mkv")
        .times(1)
        .returning(move |_| Ok(vec![fast.clone()]));

    let (service, _cache) = build_service(AppConfig::default(), upstream, storage);

    let outcome = service
        .transform_playback_info(request("/Items/12345/PlaybackInfo", None), false)
        .await
        .unwrap();

    let body: Value = serde_json::from_slice(&outcome.response.body).unwrap();
    let sources = body["MediaSources"].as_array().unwrap();
    assert_eq!(sources.len(), 4);
    assert_eq!(sources[0]["Id"], json!("src-a"));
    assert_eq!(sources[1]["Id"], json!("src-b"));
    assert_eq!(sources[2]["Id"], json!("src-a-FHD"));
    assert_eq!(sources[3]["Id"], json!("src-b-FHD"));
}

#[tokio::test]
async fn test_preview_sources_are_appended_in_submission_order() {
    let doc = json!({"MediaSources": [local_source("src1", "12345")]});

    let mut upstream = MockUpstreamServiceTrait::new();
    upstream
        .expect_forward()
        .times(1)
        .returning(move |_, _, _, _| Ok(json_response(&doc)));

    let mut storage = MockStorageServiceTrait::new();
    storage
        .expect_transcode_variants()
        .withf(|path| path.as_str() == "/movie.mkv")
        .times(1)
        .returning(|_| {
            Ok(vec![
                TranscodeVariant {
                    format_id: "FHD".to_string(),
                    resolution: "1080p".to_string(),
                    backing_url: Some("https://cdn.example.com/fhd/index.m3u8".to_string()),
                    subtitles: Vec::new(),
                },
                TranscodeVariant {
                    format_id: "HD".to_string(),
                    resolution: "720p".to_string(),
                    backing_url: Some("https://cdn.example.com/hd/index.m3u8".to_string()),
                    subtitles: Vec::new(),
                },
            ])
        });

    // previews on, mkv allow-listed
    let (service, _cache) = build_service(AppConfig::default(), upstream, storage);

    let outcome = service
        .transform_playback_info(request("/Items/12345/PlaybackInfo", None), false)
        .await
        .unwrap();

    let body: Value = serde_json::from_slice(&outcome.response.body).unwrap();
    let sources = body["MediaSources"].as_array().unwrap();
    assert_eq!(sources.len(), 3);

    // rewritten original first, then the previews in listing order
    assert_eq!(sources[0]["Id"], json!("src1"));
    assert_eq!(sources[1]["Id"], json!("src1-FHD"));
    assert_eq!(sources[2]["Id"], json!("src1-HD"));

    assert_eq!(sources[1]["Name"], json!("(1080p) 1080p HEVC"));
    assert_eq!(sources[1]["SupportsDirectPlay"], json!(false));
    assert_eq!(sources[1]["SupportsTranscoding"], json!(true));
    assert_eq!(sources[1]["TranscodingSubProtocol"], json!("hls"));
    assert_eq!(sources[1]["TranscodingContainer"], json!("ts"));
    let transcoding_url = sources[1]["TranscodingUrl"].as_str().unwrap();
    assert!(transcoding_url.starts_with("/videos/proxy_playlist?"));
    assert!(transcoding_url.contains("format_id=FHD"));
    assert!(sources[1].get("DirectStreamUrl").is_none());
}

#[tokio::test]
async fn test_disallowed_container_gets_no_previews() {
    let mut source = local_source("src1", "12345");
    source["Container"] = json!("avi");
    let doc = json!({"MediaSources": [source]});

    let mut upstream = MockUpstreamServiceTrait::new();
    upstream
        .expect_forward()
        .times(1)
        .returning(move |_, _, _, _| Ok(json_response(&doc)));

    // previews enabled, but avi isn't on the list - storage must stay idle
    let (service, _cache) = build_service(
        AppConfig::default(),
        upstream,
        MockStorageServiceTrait::new(),
    );

    let outcome = service
        .transform_playback_info(request("/Items/12345/PlaybackInfo", None), false)
        .await
        .unwrap();

    let body: Value = serde_json::from_slice(&outcome.response.body).unwrap();
    assert_eq!(body["MediaSources"].as_array().unwrap().len(), 1);
}
