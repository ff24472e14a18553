#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    http::{header, HeaderMap, Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use homewatch::{
    auth::Credentials,
    camera::{CameraError, CameraSettings, FrameGrabber},
    devices::DeviceProvider,
    metrics::Metrics,
    telemetry::TelemetryHandle,
    web::{self, AppState},
    writer::{FrameSink, WriterError, WriterSettings},
    AppConfig,
};
use image::RgbImage;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tempfile::TempDir;
use tower::ServiceExt;

pub struct FakeCamera;

impl FrameGrabber for FakeCamera {
    fn grab(&mut self) -> Result<RgbImage, CameraError> {
        std::thread::sleep(Duration::from_millis(2));
        Ok(RgbImage::from_pixel(64, 48, image::Rgb([90, 90, 90])))
    }
}

/// Counts frames and writes a placeholder file on finish, so listings see the recording.
pub struct FakeSink {
    path: PathBuf,
    frames: usize,
}

impl FrameSink for FakeSink {
    fn write_frame(&mut self, _: &RgbImage) -> Result<(), WriterError> {
        self.frames += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), WriterError> {
        std::fs::write(&self.path, vec![0u8; self.frames.max(1)])?;
        Ok(())
    }
}

pub struct FakeDevices {
    pub camera_available: bool,
}

impl DeviceProvider for FakeDevices {
    fn open_camera(&self, settings: &CameraSettings) -> Result<Box<dyn FrameGrabber>, CameraError> {
        if !self.camera_available {
            return Err(CameraError::Open {
                device: settings.device.display().to_string(),
                reason: "no such device".into(),
            });
        }
        Ok(Box::new(FakeCamera))
    }

    fn open_writer(
        &self,
        path: &Path,
        _: &WriterSettings,
    ) -> Result<Box<dyn FrameSink>, WriterError> {
        Ok(Box::new(FakeSink {
            path: path.to_path_buf(),
            frames: 0,
        }))
    }
}

pub struct TestApp {
    pub tmp: TempDir,
    pub state: AppState,
    pub router: Router,
}

pub fn test_config(tmp: &TempDir) -> AppConfig {
    AppConfig {
        service_name: "api-test".into(),
        storage_path: tmp.path().join("recordings").display().to_string(),
        camera_width: 64,
        camera_height: 48,
        simulate_sensor: true,
        ..AppConfig::default()
    }
}

pub fn app_with(config: AppConfig, tmp: TempDir, camera_available: bool) -> TestApp {
    let credentials = Arc::new(Credentials::from_users(&config.users).expect("credentials"));
    let state = AppState::new(
        config,
        Arc::new(FakeDevices { camera_available }),
        TelemetryHandle::new(),
        Arc::new(Metrics::new()),
    )
    .expect("state");
    let router = web::router(state.clone(), credentials);
    TestApp { tmp, state, router }
}

pub fn test_app() -> TestApp {
    let tmp = tempfile::tempdir().expect("create tempdir");
    let config = test_config(&tmp);
    std::fs::create_dir_all(&config.storage_path).expect("create storage dir");
    app_with(config, tmp, true)
}

pub fn basic_auth(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

pub fn request(method: &str, uri: &str, auth: Option<(&str, &str)>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some((user, password)) = auth {
        builder = builder.header(header::AUTHORIZATION, basic_auth(user, password));
    }
    builder.body(Body::empty()).expect("request")
}

pub const ADMIN: Option<(&str, &str)> = Some(("admin", "raspberry"));

pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
    let response = router.clone().oneshot(request).await.expect("infallible");
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    (status, headers, body.to_vec())
}

pub async fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let (status, _, body) = send(router, request).await;
    let json = serde_json::from_slice(&body).expect("json body");
    (status, json)
}
