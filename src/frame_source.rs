//! Live view: annotated frames from the camera, JPEG encoded and framed for
//! `multipart/x-mixed-replace` streaming.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Local;
use image::{codecs::jpeg::JpegEncoder, ImageError, RgbImage};
use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, TryLockError,
    },
};
use tokio::sync::mpsc;

use crate::{
    camera::{CameraError, CameraSettings, FrameGrabber},
    devices::DeviceProvider,
    metrics::Metrics,
    overlay::Overlay,
    recording::RecordingStatus,
    telemetry::TelemetryHandle,
};

pub const JPEG_QUALITY: u8 = 85;
pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut jpeg = Vec::with_capacity(frame.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut jpeg, quality).encode_image(frame)?;
    Ok(jpeg)
}

/// Wraps one JPEG in its multipart part: boundary line, content type, blank line, payload, CRLF.
pub fn multipart_part(jpeg: &[u8]) -> Bytes {
    let mut part = BytesMut::with_capacity(jpeg.len() + 64);
    part.put_slice(b"--");
    part.put_slice(BOUNDARY.as_bytes());
    part.put_slice(b"\r\nContent-Type: image/jpeg\r\n\r\n");
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// One camera handle plus everything needed to annotate its frames.
pub struct FrameSource {
    grabber: Box<dyn FrameGrabber>,
    telemetry: TelemetryHandle,
    recording: Arc<RecordingStatus>,
    overlay: Arc<Overlay>,
}

impl FrameSource {
    pub fn open(
        devices: &dyn DeviceProvider,
        settings: &CameraSettings,
        telemetry: TelemetryHandle,
        recording: Arc<RecordingStatus>,
        overlay: Arc<Overlay>,
    ) -> Result<Self, CameraError> {
        let grabber = devices.open_camera(settings)?;
        Ok(Self::new(grabber, telemetry, recording, overlay))
    }

    pub fn new(
        grabber: Box<dyn FrameGrabber>,
        telemetry: TelemetryHandle,
        recording: Arc<RecordingStatus>,
        overlay: Arc<Overlay>,
    ) -> Self {
        Self {
            grabber,
            telemetry,
            recording,
            overlay,
        }
    }

    /// Captures and annotates one frame. `None` means the camera stopped delivering.
    pub fn get_frame(&mut self) -> Option<RgbImage> {
        match self.grabber.grab() {
            Ok(frame) => Some(self.overlay.annotate_live(
                frame,
                Local::now(),
                &self.telemetry.latest(),
                self.recording.is_active(),
            )),
            Err(err) => {
                tracing::warn!(error = %err, "live camera returned no frame");
                None
            }
        }
    }

    /// Next multipart part. Frames that fail to encode are skipped.
    pub fn next_part(&mut self) -> Option<Bytes> {
        loop {
            let frame = self.get_frame()?;
            match encode_jpeg(&frame, JPEG_QUALITY) {
                Ok(jpeg) => return Some(multipart_part(&jpeg)),
                Err(err) => tracing::debug!(error = %err, "dropping frame that failed to encode"),
            }
        }
    }

    /// Lazy part sequence, ending when the camera stops delivering.
    pub fn generate_frames(&mut self) -> impl Iterator<Item = Bytes> + '_ {
        std::iter::from_fn(move || self.next_part())
    }
}

/// The single live camera shared by every viewer. Opened on the first stream request and
/// dropped again once it stops delivering, so the next request reopens it.
pub struct LiveView {
    camera: Mutex<Option<FrameSource>>,
    closed: AtomicBool,
    devices: Arc<dyn DeviceProvider>,
    settings: CameraSettings,
    telemetry: TelemetryHandle,
    recording: Arc<RecordingStatus>,
    overlay: Arc<Overlay>,
    metrics: Arc<Metrics>,
}

impl LiveView {
    pub fn new(
        devices: Arc<dyn DeviceProvider>,
        settings: CameraSettings,
        telemetry: TelemetryHandle,
        recording: Arc<RecordingStatus>,
        overlay: Arc<Overlay>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            camera: Mutex::new(None),
            closed: AtomicBool::new(false),
            devices,
            settings,
            telemetry,
            recording,
            overlay,
            metrics,
        }
    }

    /// Opens the camera unless it is already open. Blocks on device I/O.
    pub fn ensure_open(&self) -> Result<(), CameraError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CameraError::Closed);
        }
        let mut camera = self.camera.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::SeqCst) {
            return Err(CameraError::Closed);
        }
        if camera.is_none() {
            let source = FrameSource::open(
                self.devices.as_ref(),
                &self.settings,
                self.telemetry.clone(),
                self.recording.clone(),
                self.overlay.clone(),
            )?;
            tracing::info!(device = %self.settings.device.display(), "live camera opened");
            *camera = Some(source);
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.camera
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Refuses further opens and releases the camera without blocking. When a stream is
    /// mid-frame, that stream releases the camera once its current frame completes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let released = match self.camera.try_lock() {
            Ok(mut camera) => camera.take(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().take(),
            Err(TryLockError::WouldBlock) => {
                tracing::debug!("live camera busy, the running stream will release it");
                None
            }
        };
        if released.is_some() {
            tracing::info!("live camera released");
        }
    }

    /// Feeds parts to one viewer until the viewer disconnects, the camera stops, or the view is
    /// closed. Runs on a blocking thread; the camera lock is held for one frame at a time.
    pub fn pump(&self, tx: mpsc::Sender<Result<Bytes, Infallible>>) {
        loop {
            let part = {
                let mut camera = self.camera.lock().unwrap_or_else(PoisonError::into_inner);
                if self.closed.load(Ordering::SeqCst) {
                    if camera.take().is_some() {
                        tracing::info!("live camera released");
                    }
                    break;
                }
                let Some(source) = camera.as_mut() else {
                    break;
                };
                let part = source.next_part();
                if part.is_none() {
                    *camera = None;
                    tracing::warn!("live camera stopped delivering frames, releasing it");
                }
                part
            };
            let Some(part) = part else {
                break;
            };
            self.metrics.record_live_frame();
            if tx.blocking_send(Ok(part)).is_err() {
                tracing::debug!("live viewer disconnected");
                break;
            }
        }
    }
}
