//! HTTP control surface.
//!
//! The on-device UI and any remote operator drive the core through these
//! routes; the UI's HTML/JS itself lives outside this crate. Responses are
//! JSON except `/results`, which returns the human-readable buffer verbatim.

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tokio::time::Instant;
use tracing::{info, warn};

use meshloc_types::{RfEnvironment, TargetRef};

use crate::coordinator::{start_triangulation, Ctx, SessionError};
use crate::diag;
use crate::scanner::{hit_matches, ScanMode};

pub fn router(ctx: Ctx) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/results", get(results))
        .route("/diag", get(diag_snapshot))
        .route("/triangulate", post(triangulate))
        .route("/scan", post(scan))
        .route("/track", post(track))
        .route("/stop", post(stop))
        .route("/calibrate", post(calibrate))
        .layer(cors)
        .with_state(ctx)
}

async fn health(State(ctx): State<Ctx>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "nodeId": ctx.node_id.to_string(),
        "uptimeSecs": ctx.boot.elapsed().as_secs(),
    }))
}

async fn results(State(ctx): State<Ctx>) -> String {
    ctx.results.get().await
}

async fn diag_snapshot(State(ctx): State<Ctx>) -> Json<diag::DiagSnapshot> {
    Json(diag::snapshot(&ctx).await)
}

// ── Triangulation ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TriangulateParams {
    target: String,
    #[serde(default)]
    secs: u32,
    env: Option<u8>,
}

async fn triangulate(
    State(ctx): State<Ctx>,
    Query(params): Query<TriangulateParams>,
) -> (StatusCode, Json<Value>) {
    let target = match TargetRef::parse(&params.target) {
        Ok(t) => t,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "started": false, "error": e.to_string() })),
            );
        }
    };
    let env = match params.env {
        Some(v) => RfEnvironment::from_u8(v),
        None => *ctx.rf_env.lock().unwrap(),
    };

    match start_triangulation(&ctx, target, params.secs, env).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "started": true }))),
        Err(e @ SessionError::Debounced(_)) => {
            // Deliberate no-op: state and results buffer are untouched.
            (StatusCode::OK, Json(json!({ "started": false, "reason": e.to_string() })))
        }
        Err(e) => (
            StatusCode::CONFLICT,
            Json(json!({ "started": false, "reason": e.to_string() })),
        ),
    }
}

// ── Plain scanning ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ScanParams {
    #[serde(default)]
    secs: u32,
    target: Option<String>,
}

async fn scan(State(ctx): State<Ctx>, Query(params): Query<ScanParams>) -> Json<Value> {
    ctx.stop_requested.store(false, Ordering::SeqCst);
    ctx.scanner.start(ScanMode::Both, params.secs);
    info!(secs = params.secs, "scan started via UI");
    Json(json!({ "scanning": true }))
}

async fn track(
    State(ctx): State<Ctx>,
    Query(params): Query<ScanParams>,
) -> (StatusCode, Json<Value>) {
    let Some(target) = params.target.as_deref() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "target required" })),
        );
    };
    if TargetRef::parse(target).is_err() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "unparseable target" })),
        );
    }
    ctx.stop_requested.store(false, Ordering::SeqCst);
    ctx.scanner.start(ScanMode::Both, params.secs);
    info!(target, secs = params.secs, "tracking scan started via UI");
    (StatusCode::OK, Json(json!({ "tracking": true })))
}

async fn stop(State(ctx): State<Ctx>) -> Json<Value> {
    ctx.stop_requested.store(true, Ordering::SeqCst);
    ctx.scanner.stop();
    info!("stop requested via UI");
    Json(json!({ "stopping": true }))
}

// ── Manual path-loss calibration ──────────────────────────────────────────────

#[derive(Deserialize)]
struct CalibrateParams {
    target: String,
    distance: f32,
}

const CALIBRATION_WINDOW: Duration = Duration::from_secs(30);
const CALIBRATION_MIN_SAMPLES: usize = 10;

async fn calibrate(
    State(ctx): State<Ctx>,
    Query(params): Query<CalibrateParams>,
) -> (StatusCode, Json<Value>) {
    let target = match TargetRef::parse(&params.target) {
        Ok(t) => t,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })));
        }
    };
    if params.distance <= 0.0 || params.distance > 200.0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "distance must be in (0, 200] meters" })),
        );
    }
    if ctx.session_active().await {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "cannot calibrate during a triangulation session" })),
        );
    }

    let distance = params.distance;
    let ctx = ctx.clone();
    tokio::spawn(async move {
        run_calibration(ctx, target, distance).await;
    });
    (StatusCode::OK, Json(json!({ "calibrating": true, "windowSecs": 30 })))
}

/// Collect RSSI samples for a target at a known distance and solve the
/// reference level per radio.
async fn run_calibration(ctx: Ctx, target: TargetRef, distance_m: f32) {
    info!(%target, distance_m, "calibration window open");
    ctx.scanner.start(ScanMode::Both, 30);

    let mut wifi: Vec<f32> = Vec::new();
    let mut ble: Vec<f32> = Vec::new();
    let deadline = Instant::now() + CALIBRATION_WINDOW;
    while Instant::now() < deadline {
        while let Some(hit) = ctx.scanner.try_next_hit() {
            if hit_matches(&target, &hit) {
                if hit.is_ble {
                    ble.push(hit.rssi as f32);
                } else {
                    wifi.push(hit.rssi as f32);
                }
            }
        }
        if ctx.stop_requested.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    ctx.scanner.stop();

    let mut path_loss = ctx.path_loss.write().await;
    for (samples, is_ble) in [(&wifi, false), (&ble, true)] {
        if samples.len() >= CALIBRATION_MIN_SAMPLES {
            let mean = samples.iter().sum::<f32>() / samples.len() as f32;
            path_loss.apply_known_distance(mean, distance_m, is_ble);
            info!(
                radio = if is_ble { "BLE" } else { "WiFi" },
                samples = samples.len(),
                mean_rssi = mean,
                "calibration applied"
            );
        } else {
            warn!(
                radio = if is_ble { "BLE" } else { "WiFi" },
                samples = samples.len(),
                "calibration skipped, too few samples"
            );
        }
    }
}
