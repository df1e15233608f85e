use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::calibration::manual::suggested_command;
use crate::device::normalize_direction;
use crate::firewall;
use crate::live_status::{current_timestamp, StatusSources};
use crate::shutdown::Shutdown;
use crate::types::WindObservation;

#[derive(Clone, Debug)]
pub struct DashboardConfig {
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

pub fn build_router(sources: StatusSources) -> Router {
    Router::new()
        .route("/weather", get(weather_all))
        .route("/weather/raw", get(weather_raw))
        .route("/weather/parsed", get(weather_parsed))
        .route("/calibration/current-wind", get(current_wind))
        .route("/calibration/add-reading", post(add_reading))
        .route("/calibration/readings", get(manual_readings))
        .route("/calibration/calculate", get(calculate_manual))
        .route("/calibration/clear", post(clear_manual))
        .route("/calibration/firewall-status", get(firewall_status))
        .route("/status", get(status))
        .with_state(sources)
}

pub async fn start_dashboard(
    sources: StatusSources,
    config: DashboardConfig,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding dashboard on {}", addr))?;
    log::info!("Dashboard listening at http://{}", addr);

    axum::serve(listener, build_router(sources))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("serving dashboard")?;
    log::info!("Dashboard stopped");
    Ok(())
}

fn updated_at() -> i64 {
    current_timestamp() as i64
}

fn unavailable(message: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": message, "updated_at": updated_at() })),
    )
        .into_response()
}

/// Raw and parsed message for every type seen.
async fn weather_all(State(sources): State<StatusSources>) -> Response {
    if sources.reference.is_empty() {
        return unavailable("No data received yet");
    }

    let mut parsed = sources.reference.parsed_snapshot();
    let types: Map<String, Value> = sources
        .reference
        .raw_snapshot()
        .into_iter()
        .map(|(kind, raw)| {
            let mut entry = json!({ "raw": raw });
            if let Some(p) = parsed.remove(&kind) {
                entry["parsed"] = json!(p.data);
            }
            (kind, entry)
        })
        .collect();

    Json(json!({ "updated_at": updated_at(), "types": types })).into_response()
}

async fn weather_raw(State(sources): State<StatusSources>) -> Response {
    if sources.reference.is_empty() {
        return unavailable("No data received yet");
    }
    Json(json!({
        "updated_at": updated_at(),
        "types": sources.reference.raw_snapshot(),
    }))
    .into_response()
}

/// Parsed entries only. An empty map is still a 200.
async fn weather_parsed(State(sources): State<StatusSources>) -> Response {
    let types: Map<String, Value> = sources
        .reference
        .parsed_snapshot()
        .into_iter()
        .map(|(kind, entry)| (kind, json!(entry.data)))
        .collect();
    Json(json!({ "updated_at": updated_at(), "types": types })).into_response()
}

async fn current_wind(State(sources): State<StatusSources>) -> Response {
    match sources.reference.current_wind() {
        Some(wind) => Json(json!({
            "success": true,
            "tempest_wind": wind,
            "timestamp": updated_at(),
        }))
        .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "success": false,
                "error": "No current wind data available",
                "timestamp": updated_at(),
            })),
        )
            .into_response(),
    }
}

fn failure(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "success": false, "error": message }))).into_response()
}

/// Device reading as entered by the operator, in uncalibrated terms.
#[derive(Debug, Deserialize)]
struct AddReadingRequest {
    #[serde(default)]
    wind_speed_knots: f64,
    #[serde(default)]
    wind_direction_deg: f64,
}

/// Pair a hand-entered device reading with the reference right now.
async fn add_reading(
    State(sources): State<StatusSources>,
    body: Result<Json<AddReadingRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return failure(StatusCode::BAD_REQUEST, &rejection.body_text()),
    };
    if !request.wind_speed_knots.is_finite() || !request.wind_direction_deg.is_finite() {
        return failure(StatusCode::BAD_REQUEST, "wind values must be finite numbers");
    }
    let Some(reference) = sources.reference.current_wind() else {
        return failure(
            StatusCode::SERVICE_UNAVAILABLE,
            "No current Tempest data available",
        );
    };

    let device = WindObservation::new(
        request.wind_speed_knots,
        normalize_direction(request.wind_direction_deg),
    );
    let total = sources.manual.add(device, reference.clone());
    log::info!(
        "Manual calibration pair {}: device {:.2} kt @ {:.0}°, reference {:.2} kt @ {:.0}°",
        total,
        device.speed_knots,
        device.direction_deg,
        reference.speed_knots,
        reference.direction_deg
    );

    Json(json!({
        "success": true,
        "davis_reading": device,
        "tempest_reading": reference,
        "total_readings": total,
    }))
    .into_response()
}

async fn manual_readings(State(sources): State<StatusSources>) -> Response {
    let pairs = sources.manual.pairs();
    let davis: Vec<_> = pairs.iter().map(|p| p.device).collect();
    let tempest: Vec<_> = pairs.iter().map(|p| &p.reference).collect();
    let timestamps: Vec<_> = pairs.iter().map(|p| p.taken_at).collect();
    Json(json!({
        "success": true,
        "reading_count": pairs.len(),
        "readings": { "davis": davis, "tempest": tempest, "timestamps": timestamps },
    }))
    .into_response()
}

/// Solve the stored pairs. Only suggests startup flags; live values are untouched.
async fn calculate_manual(State(sources): State<StatusSources>) -> Response {
    match sources.manual.calculate() {
        Ok(result) => Json(json!({
            "success": true,
            "command_line": suggested_command(&result),
            "calibration": result,
            "reading_count": sources.manual.len(),
        }))
        .into_response(),
        Err(e) => failure(StatusCode::BAD_REQUEST, &e.to_string()),
    }
}

async fn clear_manual(State(sources): State<StatusSources>) -> Response {
    let removed = sources.manual.clear();
    log::info!("Cleared {} manual calibration pairs", removed);
    Json(json!({
        "success": true,
        "message": "All calibration readings cleared",
    }))
    .into_response()
}

async fn firewall_status(State(sources): State<StatusSources>) -> Response {
    let setup = sources.firewall;
    match tokio::task::spawn_blocking(move || firewall::status(setup)).await {
        Ok(status) => Json(json!({ "success": true, "firewall": status })).into_response(),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn status(State(sources): State<StatusSources>) -> impl IntoResponse {
    Json(sources.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::manual::ManualCalibration;
    use crate::calibration::state::{CalibrationParams, CalibrationState};
    use crate::direction_history::DirectionHistory;
    use crate::firewall::FirewallSetup;
    use crate::tempest::ReferenceCache;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;
    use tokio::sync::watch;
    use tower::ServiceExt;

    fn sources(reference: ReferenceCache) -> StatusSources {
        let (_, readings) = watch::channel(None);
        let (_, windows) = watch::channel(None);
        let (_, cycles) = watch::channel(None);
        StatusSources {
            started: Instant::now(),
            state: CalibrationState::new(CalibrationParams::default()),
            reference,
            readings,
            windows,
            cycles,
            history: Arc::new(Mutex::new(DirectionHistory::new())),
            manual: ManualCalibration::default(),
            firewall: FirewallSetup {
                port: 50222,
                rule_added: false,
            },
        }
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        send(router, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
    }

    async fn post_json(router: Router, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        send(router, request).await
    }

    fn add_body(speed: f64, direction: f64) -> String {
        json!({ "wind_speed_knots": speed, "wind_direction_deg": direction }).to_string()
    }

    #[tokio::test]
    async fn test_empty_cache_is_unavailable() {
        let router = build_router(sources(ReferenceCache::new()));

        let (status, json) = get_json(router.clone(), "/weather").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"], "No data received yet");

        let (status, _) = get_json(router.clone(), "/weather/raw").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, json) = get_json(router.clone(), "/weather/parsed").await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["types"].as_object().unwrap().is_empty());

        let (status, json) = get_json(router, "/calibration/current-wind").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn test_weather_bundles_raw_and_parsed() {
        let cache = ReferenceCache::new();
        cache.ingest_datagram(br#"{"type":"rapid_wind","ob":[1700000000,5.0,90.0]}"#);
        cache.ingest_datagram(br#"{"type":"evt_strike","evt":[1,2,3]}"#);
        let router = build_router(sources(cache));

        let (status, json) = get_json(router.clone(), "/weather").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["types"]["rapid_wind"]["raw"]["ob"][1], 5.0);
        assert_eq!(json["types"]["rapid_wind"]["parsed"]["direction_deg"], 90.0);
        assert!(json["types"]["evt_strike"].get("parsed").is_none());

        let (_, json) = get_json(router.clone(), "/calibration/current-wind").await;
        assert_eq!(json["success"], true);
        assert_eq!(json["tempest_wind"]["source"], "rapid_wind");

        let (status, json) = get_json(router, "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["phase"], "bootstrap");
    }

    #[tokio::test]
    async fn test_add_reading_needs_reference() {
        let sources = sources(ReferenceCache::new());
        let router = build_router(sources.clone());

        let (status, json) =
            post_json(router, "/calibration/add-reading", &add_body(10.0, 90.0)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "No current Tempest data available");
        assert!(sources.manual.is_empty());
    }

    #[tokio::test]
    async fn test_add_reading_rejects_bad_body() {
        let cache = ReferenceCache::new();
        cache.ingest_datagram(br#"{"type":"rapid_wind","ob":[1700000000,5.0,90.0]}"#);
        let router = build_router(sources(cache));

        let (status, json) =
            post_json(router.clone(), "/calibration/add-reading", "not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["success"], false);

        let (status, _) = post_json(
            router,
            "/calibration/add-reading",
            r#"{"wind_speed_knots":"fast"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_manual_calibration_workflow() {
        let cache = ReferenceCache::new();
        // 5 m/s at 100°
        cache.ingest_datagram(br#"{"type":"rapid_wind","ob":[1700000000,5.0,100.0]}"#);
        let sources = sources(cache.clone());
        let router = build_router(sources.clone());
        let reference_knots = 5.0 * crate::tempest::MPS_TO_KNOTS;

        let (status, json) = get_json(router.clone(), "/calibration/calculate").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Need at least 2 readings for calibration");

        let (status, json) = post_json(
            router.clone(),
            "/calibration/add-reading",
            &add_body(reference_knots / 2.0, 455.0),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["total_readings"], 1);
        assert_eq!(json["davis_reading"]["direction_deg"], 95.0);
        assert_eq!(json["tempest_reading"]["source"], "rapid_wind");

        post_json(
            router.clone(),
            "/calibration/add-reading",
            &add_body(reference_knots / 2.0, 95.0),
        )
        .await;

        let (_, json) = get_json(router.clone(), "/calibration/readings").await;
        assert_eq!(json["reading_count"], 2);
        assert_eq!(json["readings"]["davis"].as_array().unwrap().len(), 2);
        assert_eq!(json["readings"]["tempest"][1]["direction_deg"], 100.0);
        assert_eq!(json["readings"]["timestamps"].as_array().unwrap().len(), 2);

        let (status, json) = get_json(router.clone(), "/calibration/calculate").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["reading_count"], 2);
        let factor = json["calibration"]["speed_factor"].as_f64().unwrap();
        assert!((factor - 2.0).abs() < 1e-9);
        assert_eq!(json["calibration"]["direction_offset_deg"], 5.0);
        assert_eq!(
            json["command_line"],
            "wind_fusion --calibration-factor 2.0000 --direction-offset 5.00"
        );
        // Suggested only
        assert_eq!(sources.state.snapshot().speed_factor, 1.0);

        let (status, json) = post_json(router.clone(), "/calibration/clear", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], "All calibration readings cleared");

        let (_, json) = get_json(router, "/calibration/readings").await;
        assert_eq!(json["reading_count"], 0);
    }

    #[tokio::test]
    async fn test_calculate_without_usable_pairs() {
        let cache = ReferenceCache::new();
        cache.ingest_datagram(br#"{"type":"rapid_wind","ob":[1700000000,0.0,0.0]}"#);
        let router = build_router(sources(cache));
        for _ in 0..2 {
            post_json(router.clone(), "/calibration/add-reading", &add_body(0.0, 0.0)).await;
        }

        let (status, json) = get_json(router, "/calibration/calculate").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Could not calculate calibration factors");
    }

    #[tokio::test]
    async fn test_firewall_status_route() {
        let router = build_router(sources(ReferenceCache::new()));
        let (status, json) = get_json(router, "/calibration/firewall-status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["firewall"]["port"], 50222);
        assert_eq!(json["firewall"]["rule_added"], false);
        assert_eq!(json["firewall"]["is_linux"], cfg!(target_os = "linux"));
    }
}
