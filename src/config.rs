use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

/// Codec used by the recording writer. Names follow the FOURCC spellings operators already know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum VideoCodec {
    #[serde(rename = "XVID")]
    Xvid,
    #[serde(rename = "MJPG")]
    Mjpg,
    #[serde(rename = "mp4v")]
    Mp4v,
    #[serde(rename = "H264")]
    H264,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_directory: Option<String>,
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
    #[serde(default)]
    pub backup_path: Option<String>,
    #[serde(default)]
    pub camera_index: u32,
    #[serde(default)]
    pub camera_device: Option<String>,
    #[serde(default = "default_camera_width")]
    pub camera_width: u32,
    #[serde(default = "default_camera_height")]
    pub camera_height: u32,
    #[serde(default = "default_camera_fps")]
    pub camera_fps: u32,
    #[serde(default)]
    pub simulate_sensor: bool,
    #[serde(default = "default_sensor_i2c_bus")]
    pub sensor_i2c_bus: u8,
    #[serde(default = "default_sensor_address")]
    pub sensor_address: u16,
    #[serde(default = "default_shunt_ohms")]
    pub shunt_ohms: f64,
    #[serde(default = "default_max_expected_amps")]
    pub max_expected_amps: f64,
    #[serde(default = "default_video_codec")]
    pub video_codec: VideoCodec,
    #[serde(default = "default_record_fps")]
    pub record_fps: f64,
    #[serde(default = "default_recording_extension")]
    pub recording_extension: String,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_seconds: u64,
    /// Username to password. Values of the form `sha256:<hex>` are treated as digests.
    #[serde(default = "default_users")]
    pub users: BTreeMap<String, String>,
}

fn default_service_name() -> String {
    "homewatch".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_storage_path() -> String {
    "/mnt/ssd/recordings".to_string()
}

fn default_camera_width() -> u32 {
    640
}

fn default_camera_height() -> u32 {
    480
}

fn default_camera_fps() -> u32 {
    30
}

fn default_sensor_i2c_bus() -> u8 {
    1
}

fn default_sensor_address() -> u16 {
    0x40
}

fn default_shunt_ohms() -> f64 {
    0.1
}

fn default_max_expected_amps() -> f64 {
    3.0
}

fn default_video_codec() -> VideoCodec {
    VideoCodec::Xvid
}

fn default_record_fps() -> f64 {
    20.0
}

fn default_recording_extension() -> String {
    "avi".to_string()
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    5000
}

fn default_idle_threshold_secs() -> u64 {
    30
}

fn default_users() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("admin".to_string(), "raspberry".to_string()),
        ("viewer".to_string(), "viewer123".to_string()),
    ])
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_level: default_log_level(),
            log_directory: None,
            storage_path: default_storage_path(),
            backup_path: None,
            camera_index: 0,
            camera_device: None,
            camera_width: default_camera_width(),
            camera_height: default_camera_height(),
            camera_fps: default_camera_fps(),
            simulate_sensor: false,
            sensor_i2c_bus: default_sensor_i2c_bus(),
            sensor_address: default_sensor_address(),
            shunt_ohms: default_shunt_ohms(),
            max_expected_amps: default_max_expected_amps(),
            video_codec: default_video_codec(),
            record_fps: default_record_fps(),
            recording_extension: default_recording_extension(),
            ffmpeg_path: default_ffmpeg_path(),
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            idle_threshold_seconds: default_idle_threshold_secs(),
            users: default_users(),
        }
    }
}

impl AppConfig {
    pub fn default_path() -> &'static str {
        "config/homewatch.toml"
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let raw = fs::read_to_string(path_ref)
            .with_context(|| format!("failed to read configuration from {}", path_ref.display()))?;
        let mut config: Self = toml::from_str(&raw).with_context(|| {
            format!("failed to parse configuration from {}", path_ref.display())
        })?;
        if config.service_name.trim().is_empty() {
            config.service_name = default_service_name();
        }
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would only surface later as confusing device errors.
    pub fn validate(&self) -> Result<()> {
        if self.users.is_empty() {
            bail!("at least one user must be configured");
        }
        if self.camera_width == 0 || self.camera_height == 0 {
            bail!(
                "camera resolution {}x{} is invalid",
                self.camera_width,
                self.camera_height
            );
        }
        if self.record_fps <= 0.0 || self.camera_fps == 0 {
            bail!("frame rates must be positive");
        }
        if self.shunt_ohms <= 0.0 || self.max_expected_amps <= 0.0 {
            bail!("shunt_ohms and max_expected_amps must be positive");
        }
        let extension = self.recording_extension.trim_start_matches('.');
        if extension.is_empty() || extension.contains('/') {
            bail!("recording_extension '{}' is invalid", self.recording_extension);
        }
        Ok(())
    }

    /// Recording extension without a leading dot.
    pub fn extension(&self) -> &str {
        self.recording_extension.trim_start_matches('.')
    }

    /// The V4L2 node the camera is read from.
    pub fn camera_device_path(&self) -> PathBuf {
        match &self.camera_device {
            Some(device) => PathBuf::from(device),
            None => PathBuf::from(format!("/dev/video{}", self.camera_index)),
        }
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}
