use std::sync::Arc;

use bridge::server::error::Error;
use bridge::server::services::manifest_services::{
    DirectivePlacement, DynManifestFetcher, ManifestService, MediaManifest, MockManifestFetcher,
    classify_directive,
};
use bridge::server::services::storage_services::{
    DynStorageService, MockStorageServiceTrait, StorageResource, SubtitleTrack,
};

const BASE: &str = "https://cdn.example.com/media/";

fn sample_playlist() -> String {
    [
        "#EXTM3U",
        "#EXT-X-VERSION:3",
        "#EXT-X-TARGETDURATION:10",
        "#EXTINF:10.0,",
        "https://cdn.example.com/media/seg0.ts",
        "#EXTINF:10.0,",
        "seg1.ts",
        "#EXT-X-DISCONTINUITY",
        "#EXTINF:4.2,",
        "seg2.ts",
        "#EXT-X-ENDLIST",
    ]
    .join("\n")
}

#[test]
fn test_directive_placement_mapping() {
    assert_eq!(classify_directive("#EXTM3U"), DirectivePlacement::Head);
    assert_eq!(
        classify_directive("#EXT-X-TARGETDURATION"),
        DirectivePlacement::Head
    );
    assert_eq!(classify_directive("#EXT-X-ENDLIST"), DirectivePlacement::Tail);
    // anything unrecognized rides with the next segment
    assert_eq!(classify_directive("#EXTINF"), DirectivePlacement::SegmentAttached);
    assert_eq!(
        classify_directive("#EXT-X-SOME-FUTURE-TAG"),
        DirectivePlacement::SegmentAttached
    );
}

#[test]
fn test_parse_sorts_lines_into_their_places() {
    let manifest = MediaManifest::parse(BASE, &sample_playlist());

    assert_eq!(manifest.head_directives.len(), 3);
    assert_eq!(manifest.tail_directives, vec!["#EXT-X-ENDLIST"]);
    assert_eq!(manifest.segments.len(), 3);

    // absolute and relative segment lines both end up base-relative
    assert_eq!(manifest.segments[0].relative_url, "seg0.ts");
    assert_eq!(manifest.segments[1].relative_url, "seg1.ts");

    // the discontinuity stays glued to the segment after it
    assert_eq!(
        manifest.segments[2].preceding_directives,
        vec!["#EXT-X-DISCONTINUITY", "#EXTINF:4.2,"]
    );
}

#[test]
fn test_render_absolute_round_trips() {
    let manifest = MediaManifest::parse(BASE, &sample_playlist());
    let rendered = manifest.render_absolute();

    // every segment line is absolute now
    for line in rendered.lines().filter(|l| !l.starts_with('#')) {
        assert!(line.starts_with(BASE), "segment not absolute: {}", line);
    }

    // parsing the rendering gets the same structure back
    let reparsed = MediaManifest::parse(BASE, &rendered);
    assert_eq!(reparsed.head_directives, manifest.head_directives);
    assert_eq!(reparsed.tail_directives, manifest.tail_directives);
    assert_eq!(reparsed.segments, manifest.segments);
}

#[test]
fn test_segment_link_is_absolute_and_bounded() {
    let manifest = MediaManifest::parse(BASE, &sample_playlist());

    assert_eq!(
        manifest.segment_link(0).unwrap(),
        "https://cdn.example.com/media/seg0.ts"
    );
    assert!(manifest.segment_link(3).is_none());
}

#[test]
fn test_local_proxy_rendering_without_subtitles() {
    let mut manifest = MediaManifest::parse(BASE, &sample_playlist());
    manifest.logical_path = "/movie.mkv".to_string();
    manifest.format_id = "FHD".to_string();

    let rendered = manifest.render_local_proxy(false, "key123");

    // no backing address anywhere in the output
    assert!(!rendered.contains("cdn.example.com"));

    let proxy_lines: Vec<&str> = rendered
        .lines()
        .filter(|l| l.starts_with("/videos/proxy_ts?"))
        .collect();
    assert_eq!(proxy_lines.len(), 3);
    assert!(proxy_lines[0].contains("idx=0"));
    assert!(proxy_lines[2].contains("idx=2"));
    assert!(proxy_lines[0].contains("api_key=key123"));

    // head and tail directives survive in place
    assert!(rendered.starts_with("#EXTM3U"));
    assert!(rendered.ends_with("#EXT-X-ENDLIST"));
}

#[test]
fn test_local_proxy_rendering_with_subtitles_emits_a_variant_playlist() {
    let mut manifest = MediaManifest::parse(BASE, &sample_playlist());
    manifest.logical_path = "/movie.mkv".to_string();
    manifest.format_id = "FHD".to_string();
    manifest.subtitles = vec![
        SubtitleTrack {
            language: "en".to_string(),
            url: "https://cdn.example.com/subs/en.vtt".to_string(),
        },
        SubtitleTrack {
            language: "fr".to_string(),
            url: "https://cdn.example.com/subs/fr.vtt".to_string(),
        },
    ];

    let rendered = manifest.render_local_proxy(false, "key123");

    // a variant playlist: subtitle groups, one stream entry, zero segments
    let media_lines = rendered
        .lines()
        .filter(|l| l.starts_with("#EXT-X-MEDIA:TYPE=SUBTITLES"))
        .count();
    let stream_lines = rendered
        .lines()
        .filter(|l| l.starts_with("#EXT-X-STREAM-INF"))
        .count();
    assert_eq!(media_lines, 2);
    assert_eq!(stream_lines, 1);
    assert!(!rendered.contains("/videos/proxy_ts?"));
    assert!(rendered.contains("/videos/proxy_playlist?"));
    assert!(rendered.contains("type=main"));

    // asking for the nested main playlist gets segments again
    let main = manifest.render_local_proxy(true, "key123");
    assert_eq!(
        main.lines()
            .filter(|l| l.starts_with("/videos/proxy_ts?"))
            .count(),
        3
    );
}

#[tokio::test]
async fn test_fetch_remote_rejects_unrecognized_content_types() {
    let mut fetcher = MockManifestFetcher::new();
    fetcher
        .expect_fetch()
        .returning(|_| Ok(("text/html".to_string(), b"<html></html>".to_vec())));

    let result =
        MediaManifest::fetch_remote(&fetcher, "https://cdn.example.com/media/index.m3u8").await;
    assert!(matches!(result, Err(Error::UnexpectedContentType(_))));
}

#[tokio::test]
async fn test_fetch_remote_requires_a_path_separator() {
    let fetcher = MockManifestFetcher::new();
    let result = MediaManifest::fetch_remote(&fetcher, "no-slashes-here").await;
    assert!(matches!(result, Err(Error::InvalidAddress(_))));
}

#[tokio::test]
async fn test_seeded_backing_url_is_consumed_once() {
    let mut fetcher = MockManifestFetcher::new();
    fetcher
        .expect_fetch()
        .withf(|url| url.as_str() == "https://cdn.example.com/media/index.m3u8?token=abc")
        .times(1)
        .returning(|_| {
            Ok((
                "application/vnd.apple.mpegurl".to_string(),
                sample_playlist().into_bytes(),
            ))
        });

    // storage gets no expectations - the seeded url must make resolution
    // unnecessary, a resolve call here fails the test
    let storage = MockStorageServiceTrait::new();

    let service = ManifestService::new(
        Arc::new(fetcher) as DynManifestFetcher,
        Arc::new(storage) as DynStorageService,
    );

    service
        .seed(
            "/movie.mkv",
            "FHD",
            Some("https://cdn.example.com/media/index.m3u8?token=abc".to_string()),
            Vec::new(),
        )
        .await;

    let manifest = service.fresh("/movie.mkv", "FHD").await.unwrap();
    assert_eq!(manifest.segments.len(), 3);
    assert!(manifest.pending_backing_url.is_none());
    assert!(!manifest.is_stale(300));
}

#[tokio::test]
async fn test_unseeded_refresh_resolves_through_storage() {
    let mut fetcher = MockManifestFetcher::new();
    fetcher.expect_fetch().times(1).returning(|_| {
        Ok((
            "application/vnd.apple.mpegurl".to_string(),
            sample_playlist().into_bytes(),
        ))
    });

    let mut storage = MockStorageServiceTrait::new();
    storage
        .expect_resolve()
        .withf(|path, format, transcode| {
            path.as_str() == "/movie.mkv" && format.as_deref() == Some("FHD") && *transcode
        })
        .times(1)
        .returning(|_, _, _| {
            Ok(StorageResource {
                url: "https://cdn.example.com/media/index.m3u8?token=fresh".to_string(),
                subtitles: vec![SubtitleTrack {
                    language: "en".to_string(),
                    url: "https://cdn.example.com/subs/en.vtt".to_string(),
                }],
            })
        });

    let service = ManifestService::new(
        Arc::new(fetcher) as DynManifestFetcher,
        Arc::new(storage) as DynStorageService,
    );

    let manifest = service.fresh("/movie.mkv", "FHD").await.unwrap();
    assert_eq!(manifest.segments.len(), 3);
    // subtitles come from the resolution response
    assert_eq!(manifest.subtitles.len(), 1);
    assert_eq!(manifest.subtitles[0].language, "en");
}
