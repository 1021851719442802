use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub invoker: &'static str,
    pub active_jobs: usize,
    pub jobs_in_memory: usize,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub catalog: ComponentHealth,
    pub results_dir: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

/// GET /health — comprehensive health check with dependency status.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();

    // The catalog is healthy when the dataset root is listable.
    let catalog_check = match state.catalog.list_case_ids().await {
        Ok(_) => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(_) => ComponentHealth {
            status: "error".to_string(),
            latency_ms: None,
        },
    };

    // Results storage must exist for inference outputs and downloads.
    let results_start = std::time::Instant::now();
    let results_check = match tokio::fs::metadata(&state.config.results_dir).await {
        Ok(meta) if meta.is_dir() => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(results_start.elapsed().as_millis() as u64),
        },
        _ => ComponentHealth {
            status: "error".to_string(),
            latency_ms: None,
        },
    };

    let all_healthy = catalog_check.status == "ok" && results_check.status == "ok";
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        invoker: state.invoker.name(),
        active_jobs: state.jobs.active_count(),
        jobs_in_memory: state.jobs.len(),
        checks: HealthChecks {
            catalog: catalog_check,
            results_dir: results_check,
        },
    };

    (status_code, Json(response))
}

/// GET / — service descriptor with the main endpoints.
pub async fn root_info(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "invoker": state.invoker.name(),
        "endpoints": {
            "cases": "/api/cases",
            "segment": "/api/segment",
            "jobs": "/api/jobs/{jobId}",
            "health": "/health",
            "metrics": "/metrics",
        },
    }))
}
