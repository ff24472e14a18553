use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::{net::TcpListener, signal, sync::watch, time::Duration};

use crate::{
    auth::Credentials,
    config::AppConfig,
    devices::{DeviceProvider, SystemDevices},
    metrics,
    recording::RecordingController,
    storage,
    telemetry::{self, TelemetryHandle, TelemetrySource},
    web::{self, AppState},
};

pub struct Service {
    config: AppConfig,
    devices: Arc<dyn DeviceProvider>,
}

impl Service {
    pub fn new(config: AppConfig) -> Self {
        Self::with_devices(config, Arc::new(SystemDevices))
    }

    pub fn with_devices(config: AppConfig, devices: Arc<dyn DeviceProvider>) -> Self {
        Self { config, devices }
    }

    pub async fn run(self) -> Result<()> {
        let Self { config, devices } = self;
        let service_name = Arc::new(config.service_name.clone());
        let address = config.listen_address();

        let credentials = Arc::new(
            Credentials::from_users(&config.users).context("invalid user table")?,
        );
        if let Err(err) = storage::initialize(&config) {
            tracing::warn!(
                service = %service_name,
                error = %format!("{err:#}"),
                "storage initialization failed, check the recording volume"
            );
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let metrics = Arc::new(metrics::Metrics::new());
        let telemetry = TelemetryHandle::new();
        let source = TelemetrySource::detect(&config);

        let sampler_handle = tokio::spawn(telemetry::run_sampler(
            telemetry.clone(),
            source,
            metrics.clone(),
            shutdown_rx.clone(),
        ));
        let health_handle = tokio::spawn(metrics::monitor_health(
            service_name.clone(),
            metrics.clone(),
            shutdown_rx.clone(),
            Duration::from_secs(config.idle_threshold_seconds),
        ));

        let state = AppState::new(config, devices, telemetry, metrics)
            .context("prepare overlay renderer")?;
        let recorder = state.recorder.clone();
        let live = state.live.clone();
        let app = web::router(state, credentials);

        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("failed to bind {address}"))?;
        tracing::info!(service = %service_name, address = %address, "web interface listening");

        let shutdown_signal = {
            let service_name = service_name.clone();
            let shutdown_tx = shutdown_tx.clone();
            let recorder = recorder.clone();
            async move {
                signal::ctrl_c().await.ok();
                tracing::info!(service = %service_name, "ctrl-c received, requesting shutdown");
                shutdown_tx.send(()).ok();
                // Ends open live streams so the server can drain.
                live.close();
                finalize_recording(&service_name, &recorder).await;
            }
        };

        let server_result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .context("web server failed");

        shutdown_tx.send(()).ok();
        finalize_recording(&service_name, &recorder).await;
        sampler_handle.await??;
        health_handle.await??;
        tracing::info!(service = %service_name, "shutdown complete");

        server_result
    }
}

async fn finalize_recording(service_name: &str, recorder: &RecordingController) {
    if let Some(session) = recorder.shutdown().await {
        tracing::info!(service = %service_name, file = %session.filename, "active recording finalized");
    }
}
