use crate::telemetry::TelemetryReading;
use std::time::{SystemTime, UNIX_EPOCH};

const VOLTAGE_PERIOD_SECS: f64 = 10.0;
const CURRENT_PERIOD_SECS: f64 = 5.0;

/// Fabricates a plausible battery reading from the wall clock so the dashboard keeps moving without
/// a sensor attached. Voltage ramps through [12.0, 13.0) every 10 s and current through [0.5, 1.0)
/// every 5 s.
pub fn simulated_reading(now: SystemTime) -> TelemetryReading {
    let t = now
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default();
    let voltage = 12.0 + phase(t, VOLTAGE_PERIOD_SECS);
    let current = 0.5 + phase(t, CURRENT_PERIOD_SECS) / 2.0;
    TelemetryReading {
        voltage,
        current,
        power: voltage * current,
    }
}

/// Position within the period, scaled to [0, 1).
fn phase(t: f64, period: f64) -> f64 {
    let p = t.rem_euclid(period) / period;
    // rem_euclid can round up to exactly `period` for values just below a multiple.
    if p >= 1.0 {
        0.0
    } else {
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn simulated_values_stay_in_range() {
        let base = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        for step in 0..2_000u64 {
            let now = base + Duration::from_millis(step * 37);
            let reading = simulated_reading(now);
            assert!((12.0..13.0).contains(&reading.voltage), "{reading:?}");
            assert!((0.5..1.0).contains(&reading.current), "{reading:?}");
            assert!((reading.power - reading.voltage * reading.current).abs() < 1e-12);
        }
    }

    #[test]
    fn simulated_values_follow_the_clock() {
        let at = |secs: f64| simulated_reading(UNIX_EPOCH + Duration::from_secs_f64(secs));
        assert!((at(1_000.0).voltage - 12.0).abs() < 1e-9);
        assert!((at(1_005.0).voltage - 12.5).abs() < 1e-9);
        assert!((at(1_002.5).current - 0.75).abs() < 1e-9);
    }
}
