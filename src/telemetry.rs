use anyhow::Result;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, PoisonError, RwLock,
};
use std::time::{Duration, SystemTime};
use tokio::{sync::watch, time::interval};

use crate::{
    config::AppConfig,
    ina219::{Ina219, PowerSensor, SensorError},
    metrics::Metrics,
    simulator,
};

const SAMPLE_PERIOD: Duration = Duration::from_secs(1);

/// Latest battery measurement. Overwritten in place once per second; no history is kept.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TelemetryReading {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

#[derive(Default)]
struct TelemetryShared {
    latest: RwLock<TelemetryReading>,
    hardware: AtomicBool,
}

/// Shared view of the most recent reading, cloned into every handler and background task.
#[derive(Clone, Default)]
pub struct TelemetryHandle {
    inner: Arc<TelemetryShared>,
}

impl TelemetryHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> TelemetryReading {
        *self
            .inner
            .latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, reading: TelemetryReading) {
        *self
            .inner
            .latest
            .write()
            .unwrap_or_else(PoisonError::into_inner) = reading;
    }

    /// True when readings come from the INA219 rather than the simulator.
    pub fn hardware_active(&self) -> bool {
        self.inner.hardware.load(Ordering::Relaxed)
    }

    fn set_hardware_active(&self, active: bool) {
        self.inner.hardware.store(active, Ordering::Relaxed);
    }
}

/// Where readings come from. Chosen once at startup and never switched back to hardware.
pub enum TelemetrySource {
    Hardware(Box<dyn PowerSensor>),
    Simulated,
}

impl TelemetrySource {
    pub fn detect(config: &AppConfig) -> Self {
        if config.simulate_sensor {
            tracing::info!("sensor simulation requested, using simulated battery data");
            return Self::Simulated;
        }
        match Ina219::open(
            config.sensor_i2c_bus,
            config.sensor_address,
            config.shunt_ohms,
            config.max_expected_amps,
        ) {
            Ok(sensor) => Self::Hardware(Box::new(sensor)),
            Err(err) => {
                tracing::warn!(error = %err, "INA219 unavailable, falling back to simulated data");
                Self::Simulated
            }
        }
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self, Self::Hardware(_))
    }

    pub fn sample(&mut self, now: SystemTime) -> Result<TelemetryReading, SensorError> {
        match self {
            Self::Hardware(sensor) => {
                let raw = sensor.read()?;
                Ok(TelemetryReading {
                    voltage: raw.bus_voltage,
                    current: raw.current_ma / 1000.0,
                    power: raw.power_mw / 1000.0,
                })
            }
            Self::Simulated => Ok(simulator::simulated_reading(now)),
        }
    }
}

/// Takes one sample and publishes it. A failed sample leaves the previous reading in place.
pub fn sample_once(telemetry: &TelemetryHandle, source: &mut TelemetrySource, metrics: &Metrics) {
    match source.sample(SystemTime::now()) {
        Ok(reading) => {
            telemetry.publish(reading);
            metrics.record_sample();
        }
        Err(SensorError::Range) => {
            metrics.record_sensor_error();
            tracing::warn!("current overflow, keeping previous reading");
        }
        Err(err) => {
            metrics.record_sensor_error();
            tracing::warn!(error = %err, "sensor read error, keeping previous reading");
        }
    }
}

/// Samples once per second until shutdown. Sensor failures never end the loop.
pub async fn run_sampler(
    telemetry: TelemetryHandle,
    mut source: TelemetrySource,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<()>,
) -> Result<()> {
    telemetry.set_hardware_active(source.is_hardware());
    tracing::info!(hardware = source.is_hardware(), "battery monitoring started");
    let mut ticker = interval(SAMPLE_PERIOD);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => sample_once(&telemetry, &mut source, &metrics),
        }
    }
    tracing::info!("battery monitoring stopped");
    Ok(())
}
