use image::{imageops, RgbImage};
use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, ExitStatus},
};

use crate::{
    config::{AppConfig, VideoCodec},
    ffmpeg::{self, StderrTail},
};

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to start {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("ffmpeg error ({status}): {stderr}")]
    Ffmpeg { status: ExitStatus, stderr: String },
}

#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub codec: VideoCodec,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub ffmpeg: String,
}

impl WriterSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            codec: config.video_codec,
            fps: config.record_fps,
            width: config.camera_width,
            height: config.camera_height,
            ffmpeg: config.ffmpeg_path.clone(),
        }
    }
}

/// Destination for recorded frames.
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), WriterError>;
    /// Flushes and finalizes the output file.
    fn finish(self: Box<Self>) -> Result<(), WriterError>;
}

impl VideoCodec {
    fn encoder_args(self) -> Vec<String> {
        const VIDEO_CODEC: &str = "-c:v";
        match self {
            VideoCodec::Xvid => ffmpeg::zq(&[VIDEO_CODEC, "mpeg4", "-vtag", "xvid", "-q:v", "5"]),
            VideoCodec::Mjpg => ffmpeg::zq(&[VIDEO_CODEC, "mjpeg", "-q:v", "5"]),
            VideoCodec::Mp4v => ffmpeg::zq(&[VIDEO_CODEC, "mpeg4", "-q:v", "5"]),
            VideoCodec::H264 => ffmpeg::zq(&[
                VIDEO_CODEC,
                "libx264",
                "-preset",
                "veryfast",
                "-pix_fmt",
                "yuv420p",
            ]),
        }
    }
}

fn encode_args(path: &Path, settings: &WriterSettings) -> Vec<String> {
    let size = format!("{}x{}", settings.width, settings.height);
    let fps = settings.fps.to_string();
    vec![
        ffmpeg::prefix(),
        ffmpeg::zq(&["-y", "-f", "rawvideo", "-pix_fmt", "rgb24"]),
        ffmpeg::zq(&["-s", &size, "-r", &fps, "-i", "-"]),
        settings.codec.encoder_args(),
        vec![path.display().to_string()],
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Encodes frames by piping raw rgb24 into an `ffmpeg` child.
pub struct FfmpegWriter {
    path: PathBuf,
    width: u32,
    height: u32,
    stdin: Option<ChildStdin>,
    child: Option<Child>,
    tail: StderrTail,
}

impl FfmpegWriter {
    pub fn create(path: &Path, settings: &WriterSettings) -> Result<Self, WriterError> {
        let (mut child, tail) = ffmpeg::spawn(&settings.ffmpeg, encode_args(path, settings), true)
            .map_err(|source| WriterError::Spawn {
                program: settings.ffmpeg.clone(),
                source,
            })?;
        let stdin = child.stdin.take();
        tracing::debug!(path = %path.display(), codec = ?settings.codec, "video writer opened");
        Ok(Self {
            path: path.to_path_buf(),
            width: settings.width,
            height: settings.height,
            stdin,
            child: Some(child),
            tail,
        })
    }

    /// Waits for ffmpeg and converts a non-zero exit into an error carrying its stderr.
    fn reap(&mut self) -> Result<(), WriterError> {
        self.stdin.take();
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(WriterError::Ffmpeg {
                status,
                stderr: self.tail.summary(),
            })
        }
    }
}

impl FrameSink for FfmpegWriter {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), WriterError> {
        let resized;
        let frame = if frame.dimensions() == (self.width, self.height) {
            frame
        } else {
            resized = imageops::resize(
                frame,
                self.width,
                self.height,
                imageops::FilterType::Triangle,
            );
            &resized
        };
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        };
        match stdin.write_all(frame.as_raw()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                // ffmpeg died; its exit status explains why.
                self.reap()?;
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn finish(mut self: Box<Self>) -> Result<(), WriterError> {
        if let Some(stdin) = self.stdin.as_mut() {
            stdin.flush()?;
        }
        self.reap()?;
        tracing::debug!(path = %self.path.display(), "video writer closed");
        Ok(())
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        // Closing stdin lets ffmpeg finalize the container before we reap it.
        if let Err(err) = self.reap() {
            tracing::warn!(path = %self.path.display(), error = %err, "video writer did not exit cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(codec: VideoCodec) -> WriterSettings {
        WriterSettings {
            codec,
            fps: 20.0,
            width: 640,
            height: 480,
            ffmpeg: "ffmpeg".into(),
        }
    }

    #[test]
    fn encode_args_describe_raw_input_and_codec() {
        let args = encode_args(Path::new("/mnt/ssd/20250101_120000.avi"), &settings(VideoCodec::Xvid));
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo -pix_fmt rgb24 -s 640x480 -r 20 -i -"));
        assert!(joined.contains("-c:v mpeg4 -vtag xvid"));
        assert_eq!(args.last().map(String::as_str), Some("/mnt/ssd/20250101_120000.avi"));
    }

    #[test]
    fn each_codec_selects_an_encoder() {
        for (codec, encoder) in [
            (VideoCodec::Xvid, "mpeg4"),
            (VideoCodec::Mjpg, "mjpeg"),
            (VideoCodec::Mp4v, "mpeg4"),
            (VideoCodec::H264, "libx264"),
        ] {
            let args = codec.encoder_args();
            assert_eq!(args[0], "-c:v");
            assert_eq!(args[1], encoder);
        }
    }

    #[test]
    fn missing_ffmpeg_is_a_spawn_error() {
        let mut settings = settings(VideoCodec::Mjpg);
        settings.ffmpeg = "/nonexistent/ffmpeg".into();
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = FfmpegWriter::create(&tmp.path().join("out.avi"), &settings)
            .err()
            .expect("spawn must fail");
        assert!(matches!(err, WriterError::Spawn { .. }));
    }
}
