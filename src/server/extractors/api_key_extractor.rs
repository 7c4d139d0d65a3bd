use axum::Extension;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use tracing::error;

use crate::server::error::Error;
use crate::server::services::bridge_services::BridgeServices;
use crate::server::utils::http_utils::raw_query_param;

/// guards the manifest proxy routes - the api_key query parameter every
/// rewritten url carries has to match the configured key. not real auth,
/// just the same key-forwarding the media server itself uses
pub struct ApiKeyAuthentication(pub BridgeServices);

impl<S> FromRequestParts<S> for ApiKeyAuthentication
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Extension(services): Extension<BridgeServices> =
            Extension::from_request_parts(parts, state)
                .await
                .map_err(|err| Error::InternalServerErrorWithContext(err.to_string()))?;

        let supplied = parts
            .uri
            .query()
            .and_then(|q| raw_query_param(q, "api_key"))
            .map(|raw| urlencoding::decode(&raw).map(|s| s.into_owned()).unwrap_or(raw));

        match supplied {
            Some(key) if key == services.config.media_api_key => Ok(Self(services)),
            _ => {
                error!("proxy route hit without a valid api key");
                Err(Error::Unauthorized)
            }
        }
    }
}
