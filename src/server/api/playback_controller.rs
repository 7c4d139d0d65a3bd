use axum::Extension;
use axum::extract::Request;
use axum::http::HeaderValue;
use axum::response::Response;
use axum::routing::get;
use axum::{Router, routing::MethodRouter};
use tracing::error;

use crate::server::error::{AppResult, Error};
use crate::server::services::bridge_services::BridgeServices;
use crate::server::services::cache_space_services::{
    HEADER_CACHE_KEY, HEADER_CACHE_SPACE, HEADER_CACHE_TTL,
};
use crate::server::utils::http_utils::{capture_request, proxied_into_response};

pub struct PlaybackController;

impl PlaybackController {
    pub fn app() -> Router {
        let playback: MethodRouter = get(Self::playback_info).post(Self::playback_info);
        Router::new()
            // some clients prefix every call with /emby, same handlers
            .route("/Items/{item_id}/PlaybackInfo", playback.clone())
            .route("/emby/Items/{item_id}/PlaybackInfo", playback)
            .route("/Users/{user_id}/Items/{item_id}", get(Self::browse_item))
            .route(
                "/emby/Users/{user_id}/Items/{item_id}",
                get(Self::browse_item),
            )
    }

    /// playback-negotiation endpoint. the transformer does the real work,
    /// this just captures the request and translates the filing hint into
    /// the reserved headers the cache middleware consumes
    async fn playback_info(
        Extension(services): Extension<BridgeServices>,
        req: Request,
    ) -> AppResult<Response> {
        let captured = capture_request(req).await?;
        let outcome = services
            .playback
            .transform_playback_info(captured, false)
            .await?;

        let mut response = proxied_into_response(outcome.response);
        if let Some(hint) = outcome.filing {
            let headers = response.headers_mut();
            headers.insert(
                HEADER_CACHE_TTL,
                HeaderValue::from(hint.ttl_seconds),
            );
            headers.insert(
                HEADER_CACHE_SPACE,
                HeaderValue::from_static(hint.space),
            );
            headers.insert(
                HEADER_CACHE_KEY,
                HeaderValue::from_str(&hint.key).map_err(|e| {
                    error!("unfileable cache key: {}", e);
                    Error::InternalServerErrorWithContext("bad cache key".to_string())
                })?,
            );
        }
        Ok(response)
    }

    /// browse/detail endpoint - a plain proxy plus the media-source overlay
    async fn browse_item(
        Extension(services): Extension<BridgeServices>,
        req: Request,
    ) -> AppResult<Response> {
        let captured = capture_request(req).await?;
        let response = services.browse.patch_browse_response(captured).await?;
        Ok(proxied_into_response(response))
    }
}
