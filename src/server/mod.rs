use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::extract::Request;
use axum::http::{HeaderValue, Method};
use axum::response::Response;
use axum::routing::get;
use axum::{Extension, Router, middleware};
use once_cell::sync::Lazy;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::AppConfig;
use crate::server::api::{ManifestController, PlaybackController};
use crate::server::error::AppResult;
use crate::server::services::bridge_services::BridgeServices;
use crate::server::services::cache_space_services::cache_hint_middleware;
use crate::server::utils::http_utils::{capture_request, proxied_into_response};

pub mod api;
pub mod dtos;
pub mod error;
pub mod extractors;
pub mod services;
pub mod utils;

static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

pub fn get_app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn get_uptime_seconds() -> u64 {
    START_TIME.elapsed().as_secs()
}

pub struct ApplicationServer;

impl ApplicationServer {
    pub async fn serve(config: Arc<AppConfig>) -> anyhow::Result<()> {
        // touch it now so uptime counts from boot, not the first /health hit
        Lazy::force(&START_TIME);

        let port = config.port;
        let cors = Self::build_cors_layer(&config)?;
        let services = BridgeServices::new(config);

        // anything the route table doesn't claim goes to the origin untouched
        let router = Router::new()
            .route("/health", get(api::health_controller::health_endpoint))
            .merge(PlaybackController::app())
            .merge(ManifestController::app())
            .fallback(Self::passthrough)
            .layer(middleware::from_fn(cache_hint_middleware))
            .layer(Extension(services))
            .layer(TraceLayer::new_for_http())
            .layer(cors);

        let address = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&address)
            .await
            .context("failed to bind tcp listener")?;

        info!("bridge listening on {}", address);

        axum::serve(listener, router)
            .await
            .context("failed to serve axum app")?;

        Ok(())
    }

    fn build_cors_layer(config: &AppConfig) -> anyhow::Result<CorsLayer> {
        let cors = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any);

        if config.cors_origin == "*" {
            return Ok(cors.allow_origin(Any));
        }

        let origins = config
            .cors_origin
            .split(',')
            .map(|origin| {
                origin
                    .trim()
                    .parse::<HeaderValue>()
                    .context("invalid cors origin")
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(cors.allow_origin(origins))
    }

    /// the transparent half of the proxy - forward verbatim, relay verbatim
    async fn passthrough(
        Extension(services): Extension<BridgeServices>,
        req: Request,
    ) -> AppResult<Response> {
        let captured = capture_request(req).await?;
        let response = services
            .upstream
            .forward(
                captured.method.clone(),
                captured.path_and_query(),
                captured.headers.clone(),
                captured.body.clone(),
            )
            .await?;
        Ok(proxied_into_response(response))
    }
}
