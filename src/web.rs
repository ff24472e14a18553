use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::{path::Path, sync::Arc, time::Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    auth::{self, Credentials},
    camera::CameraSettings,
    config::AppConfig,
    devices::DeviceProvider,
    frame_source::{self, LiveView},
    metrics::{HealthSnapshot, Metrics},
    overlay::{FontError, Overlay},
    recording::{ControlError, RecorderSettings, RecordingController},
    round_to,
    storage::{self, RecordingFile, StorageSnapshot},
    telemetry::TelemetryHandle,
};

const DASHBOARD: &str = include_str!("dashboard.html");

/// Frames buffered per viewer before the pump waits on the client.
const STREAM_BUFFER: usize = 2;

/// Everything the handlers share, cloned into each request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub telemetry: TelemetryHandle,
    pub recorder: Arc<RecordingController>,
    pub live: Arc<LiveView>,
    pub metrics: Arc<Metrics>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        devices: Arc<dyn DeviceProvider>,
        telemetry: TelemetryHandle,
        metrics: Arc<Metrics>,
    ) -> Result<Self, FontError> {
        let overlay = Arc::new(Overlay::new()?);
        let recorder = Arc::new(RecordingController::new(
            RecorderSettings::from_config(&config),
            devices.clone(),
            overlay.clone(),
            metrics.clone(),
        ));
        let live = Arc::new(LiveView::new(
            devices,
            CameraSettings::from_config(&config),
            telemetry.clone(),
            recorder.status(),
            overlay,
            metrics.clone(),
        ));
        Ok(Self {
            config: Arc::new(config),
            telemetry,
            recorder,
            live,
            metrics,
            started_at: Instant::now(),
        })
    }

    fn uptime_minutes(&self) -> f64 {
        round_to(self.started_at.elapsed().as_secs_f64() / 60.0, 1)
    }
}

/// All routes, each behind HTTP Basic authentication.
pub fn router(state: AppState, credentials: Arc<Credentials>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/video_feed", get(video_feed))
        .route("/api/stats", get(stats))
        .route("/api/recordings", get(recordings))
        .route("/api/record/start", post(start_recording))
        .route("/api/record/stop", post(stop_recording))
        .route("/api/system/info", get(system_info))
        .layer(middleware::from_fn_with_state(
            credentials,
            auth::require_basic_auth,
        ))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(DASHBOARD)
}

async fn video_feed(State(state): State<AppState>) -> Response {
    let live = state.live.clone();
    let opened = tokio::task::spawn_blocking(move || live.ensure_open())
        .await
        .map_err(anyhow::Error::from)
        .and_then(|result| result.map_err(anyhow::Error::from));
    if let Err(err) = opened {
        tracing::error!(error = %format!("{err:#}"), "error initializing camera");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Camera initialization failed").into_response();
    }

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let live = state.live.clone();
    tokio::task::spawn_blocking(move || live.pump(tx));
    (
        [
            (header::CONTENT_TYPE, frame_source::CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    voltage: f64,
    current: f64,
    power: f64,
    recording: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recording_error: Option<String>,
    storage: StorageSnapshot,
    uptime: f64,
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let reading = state.telemetry.latest();
    let status = state.recorder.status();
    let storage_root = state.config.storage_path.clone();
    let storage = tokio::task::spawn_blocking(move || storage::capacity(Path::new(&storage_root)))
        .await
        .unwrap_or_else(|_| StorageSnapshot::unmounted());
    Json(StatsResponse {
        voltage: round_to(reading.voltage, 2),
        current: round_to(reading.current, 3),
        power: round_to(reading.power, 2),
        recording: status.is_active(),
        filename: status.filename(),
        recording_error: status.last_error(),
        storage,
        uptime: state.uptime_minutes(),
    })
}

#[derive(Debug, Serialize)]
struct RecordingsResponse {
    recordings: Vec<RecordingFile>,
    count: usize,
}

async fn recordings(State(state): State<AppState>) -> Json<RecordingsResponse> {
    let recordings = storage::list_recordings(
        Path::new(&state.config.storage_path),
        state.config.extension(),
    )
    .await;
    Json(RecordingsResponse {
        count: recordings.len(),
        recordings,
    })
}

fn rejected(err: ControlError) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "message": err.to_string(), "status": "error" })),
    )
        .into_response()
}

async fn start_recording(State(state): State<AppState>) -> Response {
    match state.recorder.start().await {
        Ok(session) => Json(json!({
            "message": format!("Recording started: {}", session.filename),
            "status": "success",
            "filename": session.filename,
        }))
        .into_response(),
        Err(err) => rejected(err),
    }
}

async fn stop_recording(State(state): State<AppState>) -> Response {
    match state.recorder.stop() {
        Ok(session) => Json(json!({
            "message": format!("Recording stopped: {}", session.filename),
            "status": "success",
        }))
        .into_response(),
        Err(err) => rejected(err),
    }
}

#[derive(Debug, Serialize)]
struct SystemInfo {
    hostname: String,
    version: &'static str,
    os: &'static str,
    arch: &'static str,
    uptime_minutes: f64,
    camera_available: bool,
    ina219_available: bool,
    recording: bool,
    health: HealthSnapshot,
}

async fn system_info(State(state): State<AppState>) -> Json<SystemInfo> {
    Json(SystemInfo {
        hostname: hostname(),
        version: env!("CARGO_PKG_VERSION"),
        os: std::env::consts::OS,
        arch: std::env::consts::ARCH,
        uptime_minutes: state.uptime_minutes(),
        camera_available: state.live.is_open(),
        ina219_available: state.telemetry.hardware_active(),
        recording: state.recorder.status().is_active(),
        health: state.metrics.snapshot(),
    })
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for `buf.len()` bytes for the duration of the call.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "unknown".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_is_readable() {
        let name = hostname();
        assert!(!name.is_empty());
        assert!(!name.contains('\0'));
    }

    #[test]
    fn dashboard_polls_the_api() {
        assert!(DASHBOARD.contains("/video_feed"));
        assert!(DASHBOARD.contains("setInterval(updateStats, 2000)"));
        assert!(DASHBOARD.contains("setInterval(updateRecordings, 5000)"));
    }

    #[test]
    fn idle_stats_omit_filename() {
        let body = serde_json::to_value(StatsResponse {
            voltage: 12.5,
            current: 0.75,
            power: 9.38,
            recording: false,
            filename: None,
            recording_error: None,
            storage: StorageSnapshot::unmounted(),
            uptime: 0.1,
        })
        .expect("serialize");
        assert!(body.get("filename").is_none());
        assert!(body.get("recording_error").is_none());
        assert_eq!(body["storage"]["mounted"], false);
    }
}
