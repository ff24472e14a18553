//! On-demand recording: a flag-gated blocking task that owns its own camera handle and the
//! video writer for one session at a time.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;

use crate::{
    camera::CameraSettings,
    config::AppConfig,
    devices::DeviceProvider,
    metrics::Metrics,
    overlay::Overlay,
    storage,
    writer::WriterSettings,
};

/// Consecutive failed grabs after which the camera is considered gone.
const MAX_MISSED_FRAMES: u32 = 50;
const MISS_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSession {
    pub filename: String,
    pub path: PathBuf,
    pub started_at: DateTime<Local>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("Already recording")]
    AlreadyRecording,
    #[error("Not currently recording")]
    NotRecording,
}

/// Recording state read by the live overlay and the stats endpoint.
#[derive(Debug, Default)]
pub struct RecordingStatus {
    active: AtomicBool,
    session: Mutex<Option<RecordingSession>>,
    last_error: Mutex<Option<String>>,
}

impl RecordingStatus {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn session(&self) -> Option<RecordingSession> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn filename(&self) -> Option<String> {
        self.session().map(|session| session.filename)
    }

    /// Why the most recent recording task ended abnormally, until the next accepted start.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn begin(&self, session: RecordingSession) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
        self.active.store(true, Ordering::SeqCst);
    }

    fn end(&self) -> Option<RecordingSession> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return None;
        }
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn fail(&self, message: String) {
        self.active.store(false, Ordering::SeqCst);
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }
}

#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub storage_root: PathBuf,
    pub backup_root: Option<PathBuf>,
    pub extension: String,
    pub camera: CameraSettings,
    pub writer: WriterSettings,
}

impl RecorderSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            storage_root: PathBuf::from(&config.storage_path),
            backup_root: config.backup_path.as_ref().map(PathBuf::from),
            extension: config.extension().to_string(),
            camera: CameraSettings::from_config(config),
            writer: WriterSettings::from_config(config),
        }
    }
}

/// `YYYYMMDD_HHMMSS.<ext>` in local time.
pub fn session_filename(at: DateTime<Local>, extension: &str) -> String {
    format!("{}.{}", at.format("%Y%m%d_%H%M%S"), extension)
}

pub struct RecordingController {
    status: Arc<RecordingStatus>,
    devices: Arc<dyn DeviceProvider>,
    overlay: Arc<Overlay>,
    metrics: Arc<Metrics>,
    settings: Arc<RecorderSettings>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RecordingController {
    pub fn new(
        settings: RecorderSettings,
        devices: Arc<dyn DeviceProvider>,
        overlay: Arc<Overlay>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            status: Arc::new(RecordingStatus::default()),
            devices,
            overlay,
            metrics,
            settings: Arc::new(settings),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn status(&self) -> Arc<RecordingStatus> {
        self.status.clone()
    }

    /// Accepts a start when idle: joins the previous task, names the file, flips to recording and
    /// spawns the capture task without waiting for it.
    pub async fn start(&self) -> Result<RecordingSession, ControlError> {
        let mut task = self.task.lock().await;
        if self.status.is_active() {
            return Err(ControlError::AlreadyRecording);
        }
        if let Some(previous) = task.take() {
            if let Err(err) = previous.await {
                tracing::error!(error = %err, "previous recording task panicked");
            }
        }

        let started_at = Local::now();
        let filename = session_filename(started_at, &self.settings.extension);
        let session = RecordingSession {
            path: self.settings.storage_root.join(&filename),
            filename,
            started_at,
        };
        self.status.begin(session.clone());

        let job = RecordingJob {
            session: session.clone(),
            status: self.status.clone(),
            devices: self.devices.clone(),
            overlay: self.overlay.clone(),
            metrics: self.metrics.clone(),
            settings: self.settings.clone(),
        };
        *task = Some(tokio::task::spawn_blocking(move || job.run()));
        tracing::info!(file = %session.filename, path = %session.path.display(), "recording started");
        Ok(session)
    }

    /// Cooperative: clears the flag and returns immediately; the task finishes on its own.
    pub fn stop(&self) -> Result<RecordingSession, ControlError> {
        let session = self.status.end().ok_or(ControlError::NotRecording)?;
        tracing::info!(file = %session.filename, "recording stop requested");
        Ok(session)
    }

    /// Stops and waits until the file has been finalized.
    pub async fn stop_and_wait(&self) -> Result<RecordingSession, ControlError> {
        let session = self.stop()?;
        self.join().await;
        Ok(session)
    }

    /// Stops an active session and waits for its task. A task that is already winding down after
    /// an earlier stop is waited for too. Returns the session this call stopped.
    pub async fn shutdown(&self) -> Option<RecordingSession> {
        match self.stop_and_wait().await {
            Ok(session) => Some(session),
            Err(_) => {
                self.join().await;
                None
            }
        }
    }

    /// Waits for the current or most recent recording task, if any.
    pub async fn join(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "recording task panicked");
            }
        }
    }
}

struct RecordingJob {
    session: RecordingSession,
    status: Arc<RecordingStatus>,
    devices: Arc<dyn DeviceProvider>,
    overlay: Arc<Overlay>,
    metrics: Arc<Metrics>,
    settings: Arc<RecorderSettings>,
}

struct CaptureSummary {
    frames: u64,
    duration: Duration,
}

impl RecordingJob {
    fn run(self) {
        let file = self.session.filename.as_str();
        match self.capture() {
            Ok(summary) => {
                tracing::info!(
                    file,
                    frames = summary.frames,
                    duration_secs = summary.duration.as_secs_f64(),
                    "recording saved"
                );
                if let Some(backup_root) = &self.settings.backup_root {
                    match storage::copy_to_backup(&self.session.path, backup_root) {
                        Ok(copy) => tracing::info!(file, backup = %copy.display(), "recording backed up"),
                        Err(err) => tracing::warn!(file, error = %err, "backup copy failed"),
                    }
                }
            }
            Err(err) => {
                self.metrics.record_recording_failure();
                tracing::error!(file, error = %format!("{err:#}"), "recording failed");
                self.status.fail(format!("{file}: {err:#}"));
            }
        }
    }

    fn capture(&self) -> Result<CaptureSummary> {
        let mut camera = self
            .devices
            .open_camera(&self.settings.camera)
            .context("failed to open recording camera")?;
        let mut writer = self
            .devices
            .open_writer(&self.session.path, &self.settings.writer)
            .with_context(|| {
                format!("failed to open video writer for {}", self.session.path.display())
            })?;

        let started = Instant::now();
        let mut frames = 0u64;
        let mut missed = 0u32;
        while self.status.is_active() {
            match camera.grab() {
                Ok(mut frame) => {
                    missed = 0;
                    self.overlay.stamp_timestamp(&mut frame, Local::now());
                    writer.write_frame(&frame).context("failed to write frame")?;
                    frames += 1;
                    self.metrics.record_recorded_frame();
                }
                Err(err) => {
                    missed += 1;
                    if missed >= MAX_MISSED_FRAMES {
                        return Err(anyhow!(err).context("camera stopped delivering frames"));
                    }
                    tracing::debug!(error = %err, missed, "recording camera returned no frame");
                    thread::sleep(MISS_BACKOFF);
                }
            }
        }

        drop(camera);
        writer.finish().context("failed to finalize video file")?;
        Ok(CaptureSummary {
            frames,
            duration: started.elapsed(),
        })
    }
}
