pub mod auth;
pub mod camera;
pub mod config;
pub mod devices;
pub mod ffmpeg;
pub mod frame_source;
pub mod ina219;
pub mod logging;
pub mod metrics;
pub mod overlay;
pub mod platform;
pub mod recording;
pub mod service;
pub mod simulator;
pub mod storage;
pub mod telemetry;
pub mod web;
pub mod writer;

pub use config::AppConfig;
pub use service::Service;

/// Rounds half away from zero to `places` decimals.
pub(crate) fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::round_to;

    #[test]
    fn rounds_to_places() {
        assert_eq!(round_to(12.3456, 2), 12.35);
        assert_eq!(round_to(0.7504, 3), 0.75);
        assert_eq!(round_to(1.25, 1), 1.3);
        assert_eq!(round_to(0.0, 2), 0.0);
    }
}
