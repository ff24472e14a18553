use anyhow::{Context, Result};
use clap::Parser;
use homewatch::{logging, platform, AppConfig, Service};
use std::path::{Path, PathBuf};

/// Home surveillance DVR: live view, on-demand recording and battery telemetry.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file (default: config/homewatch.toml when present)
    #[arg(long, env = "HOMEWATCH_CONFIG")]
    config: Option<PathBuf>,
    /// Address the web interface binds to
    #[arg(long)]
    listen_host: Option<String>,
    /// Port the web interface listens on
    #[arg(long)]
    port: Option<u16>,
    /// Directory recordings are written to
    #[arg(long, env = "HOMEWATCH_STORAGE")]
    storage: Option<String>,
    /// Camera index, opened as /dev/video<index>
    #[arg(long)]
    camera_index: Option<u32>,
    /// Use simulated battery readings even if an INA219 is present
    #[arg(long)]
    simulate_sensor: bool,
}

impl Cli {
    fn load_config(&self) -> Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path).with_context(|| {
                format!("unable to load configuration from {}", path.display())
            })?,
            None if Path::new(AppConfig::default_path()).exists() => {
                AppConfig::load(AppConfig::default_path()).with_context(|| {
                    format!(
                        "unable to load configuration from {}",
                        AppConfig::default_path()
                    )
                })?
            }
            None => AppConfig::default(),
        };

        if let Some(host) = &self.listen_host {
            config.listen_host = host.clone();
        }
        if let Some(port) = self.port {
            config.listen_port = port;
        }
        if let Some(storage) = &self.storage {
            config.storage_path = storage.clone();
        }
        if let Some(index) = self.camera_index {
            config.camera_index = index;
            config.camera_device = None;
        }
        if self.simulate_sensor {
            config.simulate_sensor = true;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    let _log_guard = logging::init(&config)?;
    platform::log_platform_guidance();
    tracing::info!(
        service = %config.service_name,
        storage = %config.storage_path,
        camera = %config.camera_device_path().display(),
        resolution = %format!("{}x{}@{}", config.camera_width, config.camera_height, config.camera_fps),
        address = %config.listen_address(),
        users = config.users.len(),
        "starting homewatch"
    );
    if config.users.get("admin").map(String::as_str) == Some("raspberry") {
        tracing::warn!("default admin credentials in use, change them in the configuration");
    }

    Service::new(config).run().await
}
