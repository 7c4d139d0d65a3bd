use std::sync::Arc;

use async_trait::async_trait;
use mockall::automock;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::server::error::{AppResult, Error};

pub type DynStorageService = Arc<dyn StorageServiceTrait + Send + Sync>;

/// one subtitle rendition attached to a transcoded stream
#[derive(Debug, Clone)]
pub struct SubtitleTrack {
    pub language: String,
    pub url: String,
}

/// a resolved, time-limited direct address for a file (or one of its
/// transcoded renditions) plus whatever subtitles ride along with it
#[derive(Debug, Clone)]
pub struct StorageResource {
    pub url: String,
    pub subtitles: Vec<SubtitleTrack>,
}

/// a server-side transcoded rendition the storage provider offers
#[derive(Debug, Clone)]
pub struct TranscodeVariant {
    pub format_id: String,
    pub resolution: String,
    /// direct playlist address if the provider already handed one out,
    /// lets the first refresh skip a resolution round trip
    pub backing_url: Option<String>,
    pub subtitles: Vec<SubtitleTrack>,
}

#[automock]
#[async_trait]
pub trait StorageServiceTrait {
    /// resolve a logical path (+ optional transcode format) into a fresh
    /// direct url. the backing urls expire provider-side, so this gets
    /// called again whenever a manifest refreshes
    async fn resolve(
        &self,
        logical_path: String,
        format_id: Option<String>,
        use_transcode: bool,
    ) -> AppResult<StorageResource>;

    /// list the finished transcoded renditions available for a file
    async fn transcode_variants(&self, logical_path: String)
    -> AppResult<Vec<TranscodeVariant>>;
}

// ---- alist-shaped response DTOs ----

#[derive(Deserialize)]
struct StorageApiResponse<T> {
    code: i64,
    message: String,
    data: Option<T>,
}

#[derive(Deserialize)]
struct FsGetData {
    raw_url: String,
}

#[derive(Deserialize)]
struct VideoPreviewData {
    video_preview_play_info: PlayInfo,
}

#[derive(Deserialize)]
struct PlayInfo {
    #[serde(default)]
    live_transcoding_task_list: Vec<TranscodeTask>,
    #[serde(default)]
    live_transcoding_subtitle_task_list: Vec<SubtitleTask>,
}

#[derive(Deserialize)]
struct TranscodeTask {
    template_id: String,
    status: String,
    url: Option<String>,
}

#[derive(Deserialize)]
struct SubtitleTask {
    language: String,
    status: String,
    url: Option<String>,
}

/// rough display labels for the provider's fixed template ids
fn resolution_label(template_id: &str) -> String {
    match template_id {
        "QHD" => "1440p".to_string(),
        "FHD" => "1080p".to_string(),
        "HD" => "720p".to_string(),
        "SD" => "540p".to_string(),
        "LD" => "360p".to_string(),
        other => other.to_string(),
    }
}

pub struct CloudStorageService {
    http: reqwest::Client,
    host: String,
    token: String,
}

impl CloudStorageService {
    pub fn new(http: reqwest::Client, host: String, token: String) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            http,
            token,
        }
    }

    async fn preview_info(&self, logical_path: &str) -> AppResult<PlayInfo> {
        let url = format!("{}/api/fs/other", self.host);
        let body = json!({ "path": logical_path, "method": "video_preview", "password": "" });

        let response = self
            .http
            .post(&url)
            .header("Authorization", &self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::UpstreamResolutionFailed(e.to_string()))?;

        let parsed: StorageApiResponse<VideoPreviewData> = response
            .json()
            .await
            .map_err(|e| Error::UpstreamResolutionFailed(e.to_string()))?;

        if parsed.code != 200 {
            return Err(Error::UpstreamResolutionFailed(parsed.message));
        }

        parsed
            .data
            .map(|d| d.video_preview_play_info)
            .ok_or_else(|| Error::UpstreamResolutionFailed("empty preview payload".to_string()))
    }

    fn collect_subtitles(tasks: &[SubtitleTask]) -> Vec<SubtitleTrack> {
        tasks
            .iter()
            .filter(|t| t.status == "finished")
            .filter_map(|t| {
                t.url.as_ref().map(|url| SubtitleTrack {
                    language: t.language.clone(),
                    url: url.clone(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl StorageServiceTrait for CloudStorageService {
    async fn resolve(
        &self,
        logical_path: String,
        format_id: Option<String>,
        use_transcode: bool,
    ) -> AppResult<StorageResource> {
        if use_transcode {
            let format_id = format_id.ok_or(Error::MissingIdentity)?;
            let info = self.preview_info(&logical_path).await?;
            let subtitles = Self::collect_subtitles(&info.live_transcoding_subtitle_task_list);

            let task = info
                .live_transcoding_task_list
                .into_iter()
                .find(|t| t.template_id == format_id && t.status == "finished")
                .ok_or_else(|| {
                    Error::UpstreamResolutionFailed(format!(
                        "no finished rendition for template {}",
                        format_id
                    ))
                })?;

            let url = task.url.ok_or_else(|| {
                Error::UpstreamResolutionFailed("rendition finished without a url".to_string())
            })?;

            debug!("resolved transcoded url for {} ({})", logical_path, format_id);
            return Ok(StorageResource { url, subtitles });
        }

        let url = format!("{}/api/fs/get", self.host);
        let body = json!({ "path": logical_path, "password": "" });

        let response = self
            .http
            .post(&url)
            .header("Authorization", &self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::UpstreamResolutionFailed(e.to_string()))?;

        let parsed: StorageApiResponse<FsGetData> = response
            .json()
            .await
            .map_err(|e| Error::UpstreamResolutionFailed(e.to_string()))?;

        if parsed.code != 200 {
            return Err(Error::UpstreamResolutionFailed(parsed.message));
        }

        let data = parsed
            .data
            .ok_or_else(|| Error::UpstreamResolutionFailed("empty fs/get payload".to_string()))?;

        Ok(StorageResource {
            url: data.raw_url,
            subtitles: Vec::new(),
        })
    }

    async fn transcode_variants(
        &self,
        logical_path: String,
    ) -> AppResult<Vec<TranscodeVariant>> {
        let info = self.preview_info(&logical_path).await?;
        let subtitles = Self::collect_subtitles(&info.live_transcoding_subtitle_task_list);

        Ok(info
            .live_transcoding_task_list
            .into_iter()
            .filter(|t| t.status == "finished")
            .map(|t| TranscodeVariant {
                resolution: resolution_label(&t.template_id),
                format_id: t.template_id,
                backing_url: t.url,
                subtitles: subtitles.clone(),
            })
            .collect())
    }
}
