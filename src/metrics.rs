use anyhow::Result;
use serde::Serialize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::interval;

/// Aggregates counters that the health monitor and the diagnostics endpoint report on.
#[derive(Default)]
pub struct Metrics {
    live_frames: AtomicU64,
    recorded_frames: AtomicU64,
    sensor_errors: AtomicU64,
    recording_failures: AtomicU64,
    last_sample: Mutex<Option<Instant>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_live_frame(&self) {
        self.live_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recorded_frame(&self) {
        self.recorded_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sensor_error(&self) {
        self.sensor_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recording_failure(&self) {
        self.recording_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sample(&self) {
        if let Ok(mut guard) = self.last_sample.lock() {
            *guard = Some(Instant::now());
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let last_sample_age = self.last_sample.lock().ok().and_then(|guard| {
            guard.map(|instant| Instant::now().saturating_duration_since(instant))
        });
        HealthSnapshot {
            live_frames: self.live_frames.load(Ordering::Relaxed),
            recorded_frames: self.recorded_frames.load(Ordering::Relaxed),
            sensor_errors: self.sensor_errors.load(Ordering::Relaxed),
            recording_failures: self.recording_failures.load(Ordering::Relaxed),
            last_sample_age,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub live_frames: u64,
    pub recorded_frames: u64,
    pub sensor_errors: u64,
    pub recording_failures: u64,
    #[serde(skip)]
    pub last_sample_age: Option<Duration>,
}

pub async fn monitor_health(
    service_name: Arc<String>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<()>,
    idle_threshold: Duration,
) -> Result<()> {
    let mut ticker = interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let snapshot = metrics.snapshot();
                tracing::info!(
                    service = %service_name,
                    live_frames = snapshot.live_frames,
                    recorded_frames = snapshot.recorded_frames,
                    sensor_errors = snapshot.sensor_errors,
                    recording_failures = snapshot.recording_failures,
                    "health heartbeat"
                );
                if let Some(age) = snapshot.last_sample_age {
                    if age > idle_threshold {
                        tracing::warn!(
                            service = %service_name,
                            idle_seconds = ?age.as_secs_f64(),
                            "no telemetry sample in the last {} seconds",
                            idle_threshold.as_secs()
                        );
                    }
                }
            }
        }
    }
    Ok(())
}
