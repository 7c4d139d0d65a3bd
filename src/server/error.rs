use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

pub type AppResult<T> = Result<T, Error>;

/// all the ways a proxied request can die
///
/// cache misses are NOT in here on purpose - a miss just means "go ask the
/// origin", it's control flow and the services signal it with Option/bool
#[derive(Debug, Error)]
pub enum Error {
    /// the request path/query doesn't carry a resource id we can work with
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// api_key query param missing or wrong on a proxy route
    #[error("unauthorized")]
    Unauthorized,

    /// origin media server said no (or the transport died on the way there),
    /// we surface its own status when we have one
    #[error("upstream error ({status}): {message}")]
    UpstreamError { status: u16, message: String },

    /// playlist text could not be read at all - unknown tags are NOT an error
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    /// a backing url with no path separator to derive a base from
    #[error("invalid manifest address: {0}")]
    InvalidAddress(String),

    /// remote served something that is not a playlist
    #[error("unexpected content type: {0}")]
    UnexpectedContentType(String),

    /// manifest has no (logical_path, format_id) identity to refresh against
    #[error("manifest identity not set")]
    MissingIdentity,

    /// the storage listing backend refused to hand out a fresh backing url
    #[error("upstream resolution failed: {0}")]
    UpstreamResolutionFailed(String),

    #[error("internal server error")]
    InternalServerError,

    #[error("internal server error: {0}")]
    InternalServerErrorWithContext(String),
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::UpstreamError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::UpstreamResolutionFailed(_) => StatusCode::BAD_GATEWAY,
            Self::MalformedManifest(_)
            | Self::InvalidAddress(_)
            | Self::UnexpectedContentType(_)
            | Self::MissingIdentity
            | Self::InternalServerError
            | Self::InternalServerErrorWithContext(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("request failed: {}", self);
        }
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
