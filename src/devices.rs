use std::path::Path;

use crate::{
    camera::{CameraError, CameraSettings, FfmpegCamera, FrameGrabber},
    writer::{FfmpegWriter, FrameSink, WriterError, WriterSettings},
};

/// Opens capture devices and video writers. The live view and the recorder each acquire their
/// own camera through this seam.
pub trait DeviceProvider: Send + Sync {
    fn open_camera(&self, settings: &CameraSettings) -> Result<Box<dyn FrameGrabber>, CameraError>;

    fn open_writer(
        &self,
        path: &Path,
        settings: &WriterSettings,
    ) -> Result<Box<dyn FrameSink>, WriterError>;
}

/// Real hardware: V4L2 cameras and files encoded by ffmpeg.
pub struct SystemDevices;

impl DeviceProvider for SystemDevices {
    fn open_camera(&self, settings: &CameraSettings) -> Result<Box<dyn FrameGrabber>, CameraError> {
        Ok(Box::new(FfmpegCamera::open(settings)?))
    }

    fn open_writer(
        &self,
        path: &Path,
        settings: &WriterSettings,
    ) -> Result<Box<dyn FrameSink>, WriterError> {
        Ok(Box::new(FfmpegWriter::create(path, settings)?))
    }
}
