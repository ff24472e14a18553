use image::RgbImage;
use std::{
    io::{self, Read},
    path::PathBuf,
    process::{Child, ChildStdout},
};

use crate::{
    config::AppConfig,
    ffmpeg::{self, StderrTail},
};

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub device: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub ffmpeg: String,
}

impl CameraSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            device: config.camera_device_path(),
            width: config.camera_width,
            height: config.camera_height,
            fps: config.camera_fps,
            ffmpeg: config.ffmpeg_path.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("cannot open camera {device}: {reason}")]
    Open { device: String, reason: String },
    #[error("camera stream ended")]
    EndOfStream,
    #[error("camera has been shut down")]
    Closed,
    #[error("camera I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A device that produces RGB frames one at a time.
pub trait FrameGrabber: Send {
    fn grab(&mut self) -> Result<RgbImage, CameraError>;
}

/// Reads a V4L2 camera through an `ffmpeg` child that emits fixed-size rgb24 frames on stdout.
pub struct FfmpegCamera {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    pending: Option<RgbImage>,
}

fn capture_args(settings: &CameraSettings) -> Vec<String> {
    let size = format!("{}x{}", settings.width, settings.height);
    let scale = format!("scale={}:{}", settings.width, settings.height);
    let fps = settings.fps.to_string();
    let device = settings.device.display().to_string();
    vec![
        ffmpeg::prefix(),
        ffmpeg::zq(&["-f", "v4l2", "-framerate", &fps, "-video_size", &size]),
        ffmpeg::zq(&["-i", &device, "-vf", &scale]),
        ffmpeg::zq(&["-pix_fmt", "rgb24", "-f", "rawvideo", "-"]),
    ]
    .into_iter()
    .flatten()
    .collect()
}

impl FfmpegCamera {
    /// Opens the device and waits for the first frame, so a camera that cannot deliver fails here
    /// rather than on the first read.
    pub fn open(settings: &CameraSettings) -> Result<Self, CameraError> {
        let device = settings.device.display().to_string();
        let open_error = |reason: String| CameraError::Open {
            device: device.clone(),
            reason,
        };
        if !settings.device.exists() {
            return Err(open_error("device node does not exist".into()));
        }

        let (mut child, tail) = ffmpeg::spawn(&settings.ffmpeg, capture_args(settings), false)
            .map_err(|err| open_error(format!("failed to start {}: {err}", settings.ffmpeg)))?;
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(open_error("ffmpeg stdout unavailable".into()));
        };

        let mut camera = Self {
            child,
            stdout,
            width: settings.width,
            height: settings.height,
            pending: None,
        };
        match camera.read_frame() {
            Ok(frame) => {
                camera.pending = Some(frame);
                tracing::info!(
                    device = %device,
                    width = settings.width,
                    height = settings.height,
                    fps = settings.fps,
                    "camera initialized"
                );
                Ok(camera)
            }
            Err(err) => {
                drop(camera);
                Err(open_error(describe_failure(&err, &tail)))
            }
        }
    }

    fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
        let mut buf = vec![0u8; self.width as usize * self.height as usize * 3];
        match self.stdout.read_exact(&mut buf) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(CameraError::EndOfStream)
            }
            Err(err) => return Err(err.into()),
        }
        RgbImage::from_raw(self.width, self.height, buf).ok_or_else(|| {
            CameraError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "short frame buffer",
            ))
        })
    }
}

fn describe_failure(err: &CameraError, tail: &StderrTail) -> String {
    // Give the drain thread a moment to collect ffmpeg's last words.
    std::thread::sleep(std::time::Duration::from_millis(50));
    format!("{err} ({})", tail.summary())
}

impl FrameGrabber for FfmpegCamera {
    fn grab(&mut self) -> Result<RgbImage, CameraError> {
        match self.pending.take() {
            Some(frame) => Ok(frame),
            None => self.read_frame(),
        }
    }
}

impl Drop for FfmpegCamera {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
