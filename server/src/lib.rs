//! HTTP and tool-call surface for the magnetic navigation service.
//!
//! The router is built in a library function so handlers are testable
//! without binding a socket. Service state travels as an `Arc<AppState>`
//! handle; its lifetime equals the transport's lifetime and nothing is
//! process-global.
//!
//! Two surfaces share the one service:
//! - the thin HTTP API (`/healthz`, `/estimate`) whose `/estimate` body is
//!   a position-domain observation `{lat, lon}`;
//! - the tool surface (`POST /tools/{name}`) whose `estimate_position`
//!   takes a magnetic scalar. The two observation shapes are deliberately
//!   distinct and never reinterpreted as one another.

pub mod tools;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use magnav::geo::LatLon;
use magnav::service::NavService;
use magnav::NavError;

/// Environment variable naming the anomaly map file
pub const MAP_PATH_ENV: &str = "QMAG_NAV_MAP_PATH";

/// Shared transport state
pub struct AppState {
    pub service: NavService,
}

/// Build the application router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/estimate", post(estimate))
        .route("/tools/{name}", post(call_tool))
        .with_state(state)
}

/// Map a service error onto an HTTP status and structured body.
fn error_response(err: NavError) -> Response {
    let status = match &err {
        NavError::Domain(_) | NavError::Config(_) => StatusCode::BAD_REQUEST,
        NavError::OutOfMap { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        NavError::MapIo(_) => StatusCode::SERVICE_UNAVAILABLE,
        NavError::MapFormat(_) | NavError::Numeric(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = match &err {
        NavError::OutOfMap { lat, lon } => json!({
            "error": "out_of_map",
            "lat": lat,
            "lon": lon,
            "message": err.to_string(),
        }),
        other => json!({
            "error": error_tag(other),
            "message": other.to_string(),
        }),
    };
    (status, Json(body)).into_response()
}

fn error_tag(err: &NavError) -> &'static str {
    match err {
        NavError::Domain(_) => "domain",
        NavError::Config(_) => "config",
        NavError::MapIo(_) => "map_io",
        NavError::MapFormat(_) => "map_format",
        NavError::OutOfMap { .. } => "out_of_map",
        NavError::Numeric(_) => "numeric",
    }
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct EstimateRequest {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Serialize)]
struct EstimateResponse {
    lat: f64,
    lon: f64,
    quality: f64,
}

/// Position-domain observation endpoint. Requires a loaded map even though
/// the update itself is map-free, so clients discover a misconfigured
/// deployment on their first call rather than on their first field query.
async fn estimate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EstimateRequest>,
) -> Response {
    if !state.service.has_map() {
        return error_response(NavError::MapIo("no magnetic map loaded".into()));
    }
    let observation = match LatLon::new(request.lat, request.lon) {
        Ok(position) => position,
        Err(err) => return error_response(err),
    };
    match state.service.observe_position(observation, 1.0) {
        Ok(estimate) => Json(EstimateResponse {
            lat: estimate.lat,
            lon: estimate.lon,
            quality: estimate.quality,
        })
        .into_response(),
        Err(err) => {
            warn!("estimate failed: {err}");
            error_response(err)
        }
    }
}

/// Tool dispatch: one POST per operation, JSON arguments in the body.
async fn call_tool(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(arguments): Json<Value>,
) -> Response {
    let result = match name.as_str() {
        "query_magnetic_field" => tools::query_magnetic_field(&state.service, arguments),
        "estimate_position" => tools::estimate_position(&state.service, arguments),
        "calibrate_sensor" => tools::calibrate_sensor(arguments),
        "simulate_trajectory" => tools::simulate_trajectory(&state.service, arguments),
        _ => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "unknown_tool", "tool": name })),
            )
                .into_response();
        }
    };
    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => {
            warn!("tool {name} failed: {err}");
            error_response(err)
        }
    }
}
