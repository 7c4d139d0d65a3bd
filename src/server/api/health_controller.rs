use std::time::Instant;

use axum::Extension;
use axum::Json;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::error;

use crate::server::dtos::health_dto::{
    HealthResponse, HealthStatus, OriginHealth, ServiceHealthDetails,
};
use crate::server::services::bridge_services::BridgeServices;
use crate::server::{get_app_version, get_uptime_seconds};

/// health endpoint - only checks the origin media server
/// if this isn't wanted comment out the health endpoint in ../mod.rs
pub async fn health_endpoint(
    Extension(services): Extension<BridgeServices>,
) -> (StatusCode, Json<HealthResponse>) {
    let origin_health = check_origin_health(&services).await;

    // one collaborator, so the overall status is just its status
    let overall_status = origin_health.status;

    let response = HealthResponse {
        status: overall_status,
        timestamp: Utc::now(),
        uptime_seconds: get_uptime_seconds(),
        version: get_app_version().to_string(),
        environment: format!("{:?}", services.config.cargo_env).to_lowercase(),
        services: ServiceHealthDetails {
            origin: origin_health,
        },
    };

    let http_status = match overall_status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(response))
}

async fn check_origin_health(services: &BridgeServices) -> OriginHealth {
    let started = Instant::now();
    // any response at all counts, we only care that the origin is reachable
    match services.http.get(&services.config.media_host).send().await {
        Ok(_) => OriginHealth {
            status: HealthStatus::Healthy,
            response_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        },
        Err(e) => {
            error!("Origin health check failed: {}", e);
            OriginHealth {
                status: HealthStatus::Unhealthy,
                response_time_ms: 0.0,
            }
        }
    }
}
