//! INA219 current/voltage monitor on a Linux i2c-dev bus.
//!
//! The chip is programmed for the 16 V bus range with the shunt PGA at /8 (±320 mV) and 12-bit
//! continuous conversions. Readings are reported in the units the chip naturally yields after
//! calibration: volts on the bus, milliamps and milliwatts through the shunt.

use std::{
    fs::OpenOptions,
    io::{self, Read, Write},
    os::fd::AsRawFd,
};

const I2C_SLAVE: libc::c_ulong = 0x0703;

const REG_CONFIG: u8 = 0x00;
const REG_BUS_VOLTAGE: u8 = 0x02;
const REG_POWER: u8 = 0x03;
const REG_CURRENT: u8 = 0x04;
const REG_CALIBRATION: u8 = 0x05;

/// BRNG=16V, PG=/8, BADC=12bit, SADC=12bit, MODE=shunt and bus continuous.
const CONFIG_16V_CONTINUOUS: u16 = 0x199F;

/// Fixed scaling constant from the datasheet calibration equation.
const CALIBRATION_SCALE: f64 = 0.04096;

const BUS_VOLTAGE_LSB: f64 = 0.004;

#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("failed to open i2c bus {path}: {source}")]
    Open { path: String, source: io::Error },
    #[error("i2c transfer failed: {0}")]
    Io(#[from] io::Error),
    #[error("no usable calibration for shunt {shunt_ohms} ohm and {max_expected_amps} A")]
    Calibration {
        shunt_ohms: f64,
        max_expected_amps: f64,
    },
    #[error("current out of range for the configured shunt")]
    Range,
}

/// One raw measurement in sensor units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub bus_voltage: f64,
    pub current_ma: f64,
    pub power_mw: f64,
}

/// Source of power measurements. Implemented by the INA219 driver; tests substitute their own.
pub trait PowerSensor: Send {
    fn read(&mut self) -> Result<RawSample, SensorError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub register: u16,
    /// Amps per bit of the current register.
    pub current_lsb: f64,
    /// Watts per bit of the power register.
    pub power_lsb: f64,
}

impl Calibration {
    pub fn compute(shunt_ohms: f64, max_expected_amps: f64) -> Result<Self, SensorError> {
        let invalid = || SensorError::Calibration {
            shunt_ohms,
            max_expected_amps,
        };
        if shunt_ohms <= 0.0 || max_expected_amps <= 0.0 {
            return Err(invalid());
        }
        let current_lsb = max_expected_amps / 32768.0;
        let register = (CALIBRATION_SCALE / (current_lsb * shunt_ohms)).trunc();
        if !(2.0..=65534.0).contains(&register) {
            return Err(invalid());
        }
        // Bit 0 of the calibration register is read-only.
        let register = (register as u16) & 0xFFFE;
        Ok(Self {
            register,
            current_lsb,
            power_lsb: current_lsb * 20.0,
        })
    }

    fn current_ma(&self, raw: u16) -> f64 {
        f64::from(raw as i16) * self.current_lsb * 1000.0
    }

    fn power_mw(&self, raw: u16) -> f64 {
        f64::from(raw) * self.power_lsb * 1000.0
    }
}

/// Decodes the bus voltage register, rejecting samples flagged with math overflow.
pub fn decode_bus_voltage(raw: u16) -> Result<f64, SensorError> {
    if raw & 0x0001 != 0 {
        return Err(SensorError::Range);
    }
    Ok(f64::from(raw >> 3) * BUS_VOLTAGE_LSB)
}

/// Byte transport to the chip. The i2c-dev file in production.
trait RegisterBus: Read + Write + Send {}

impl<T: Read + Write + Send> RegisterBus for T {}

pub struct Ina219 {
    bus: Box<dyn RegisterBus>,
    calibration: Calibration,
}

impl Ina219 {
    pub fn open(
        bus: u8,
        address: u16,
        shunt_ohms: f64,
        max_expected_amps: f64,
    ) -> Result<Self, SensorError> {
        let calibration = Calibration::compute(shunt_ohms, max_expected_amps)?;
        let path = format!("/dev/i2c-{bus}");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| SensorError::Open {
                path: path.clone(),
                source,
            })?;

        // SAFETY: the descriptor is owned by `file` and stays open for the duration of the call.
        let rc = unsafe {
            libc::ioctl(file.as_raw_fd(), I2C_SLAVE as _, libc::c_ulong::from(address))
        };
        if rc < 0 {
            return Err(SensorError::Io(io::Error::last_os_error()));
        }

        let mut sensor = Self {
            bus: Box::new(file),
            calibration,
        };
        sensor.write_register(REG_CONFIG, CONFIG_16V_CONTINUOUS)?;
        sensor.write_register(REG_CALIBRATION, calibration.register)?;

        let readback = sensor.read_register(REG_CONFIG)?;
        if readback != CONFIG_16V_CONTINUOUS {
            return Err(SensorError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("config register reads back {readback:#06x}"),
            )));
        }
        tracing::info!(
            path = %path,
            address = %format!("{address:#04x}"),
            calibration = calibration.register,
            "INA219 sensor initialized"
        );
        Ok(sensor)
    }

    fn write_register(&mut self, register: u8, value: u16) -> Result<(), SensorError> {
        let [hi, lo] = value.to_be_bytes();
        self.bus.write_all(&[register, hi, lo])?;
        Ok(())
    }

    fn read_register(&mut self, register: u8) -> Result<u16, SensorError> {
        self.bus.write_all(&[register])?;
        let mut buf = [0u8; 2];
        self.bus.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }
}

impl PowerSensor for Ina219 {
    fn read(&mut self) -> Result<RawSample, SensorError> {
        let raw_bus = self.read_register(REG_BUS_VOLTAGE)?;
        let raw_current = self.read_register(REG_CURRENT)?;
        let raw_power = self.read_register(REG_POWER)?;
        let bus_voltage = decode_bus_voltage(raw_bus)?;
        let current_ma = self.calibration.current_ma(raw_current);
        let power_mw = self.calibration.power_mw(raw_power);
        Ok(RawSample {
            bus_voltage,
            current_ma,
            power_mw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};

    /// Register file behind an i2c-dev style pointer write + two byte read.
    #[derive(Default)]
    struct RegisterMap {
        registers: HashMap<u8, u16>,
        pointer: u8,
        pending: VecDeque<u8>,
    }

    impl RegisterMap {
        fn with(values: &[(u8, u16)]) -> Self {
            Self {
                registers: values.iter().copied().collect(),
                ..Self::default()
            }
        }
    }

    impl Write for RegisterMap {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match buf {
                [register] => self.pointer = *register,
                [register, hi, lo] => {
                    self.registers
                        .insert(*register, u16::from_be_bytes([*hi, *lo]));
                }
                _ => return Err(io::Error::other("unexpected transfer length")),
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for RegisterMap {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                let value = self.registers.get(&self.pointer).copied().unwrap_or(0);
                self.pending.extend(value.to_be_bytes());
            }
            let mut n = 0;
            while n < buf.len() {
                let Some(byte) = self.pending.pop_front() else {
                    break;
                };
                buf[n] = byte;
                n += 1;
            }
            Ok(n)
        }
    }

    fn sensor(values: &[(u8, u16)]) -> Ina219 {
        Ina219 {
            bus: Box::new(RegisterMap::with(values)),
            calibration: Calibration::compute(0.1, 3.0).unwrap(),
        }
    }

    #[test]
    fn read_converts_all_three_registers() {
        let mut ina = sensor(&[
            (REG_BUS_VOLTAGE, (3000 << 3) | 0x2),
            (REG_CURRENT, 1000),
            (REG_POWER, 500),
        ]);
        let sample = ina.read().expect("sample");
        let current_lsb = 3.0 / 32768.0;
        assert!((sample.bus_voltage - 12.0).abs() < 1e-9);
        assert!((sample.current_ma - 1000.0 * current_lsb * 1000.0).abs() < 1e-9);
        assert!((sample.power_mw - 500.0 * current_lsb * 20.0 * 1000.0).abs() < 1e-9);
    }

    #[test]
    fn read_reports_reverse_current_as_negative() {
        let mut ina = sensor(&[
            (REG_BUS_VOLTAGE, 3000 << 3),
            (REG_CURRENT, (-200i16) as u16),
        ]);
        let sample = ina.read().expect("sample");
        assert!(sample.current_ma < 0.0);
        assert_eq!(sample.power_mw, 0.0);
    }

    #[test]
    fn read_rejects_overflowed_conversion() {
        let mut ina = sensor(&[(REG_BUS_VOLTAGE, (3000 << 3) | 0x1), (REG_CURRENT, 1000)]);
        assert!(matches!(ina.read(), Err(SensorError::Range)));
    }

    #[test]
    fn calibration_for_default_shunt() {
        let cal = Calibration::compute(0.1, 3.0).expect("calibration");
        assert_eq!(cal.register, 4472);
        assert!((cal.current_lsb - 3.0 / 32768.0).abs() < 1e-12);
        assert!((cal.power_lsb - cal.current_lsb * 20.0).abs() < 1e-12);
    }

    #[test]
    fn calibration_rejects_nonsense() {
        assert!(matches!(
            Calibration::compute(0.0, 3.0),
            Err(SensorError::Calibration { .. })
        ));
        // A huge shunt drives the register below its usable range.
        assert!(Calibration::compute(1000.0, 3.0).is_err());
    }

    #[test]
    fn bus_voltage_decodes_and_flags_overflow() {
        assert!((decode_bus_voltage(3000 << 3).unwrap() - 12.0).abs() < 1e-9);
        // CNVR bit set is fine, OVF is not.
        assert!((decode_bus_voltage((3000 << 3) | 0x2).unwrap() - 12.0).abs() < 1e-9);
        assert!(matches!(
            decode_bus_voltage((3000 << 3) | 0x1),
            Err(SensorError::Range)
        ));
    }

    #[test]
    fn current_register_is_signed() {
        let cal = Calibration::compute(0.1, 3.0).unwrap();
        let forward = cal.current_ma(1000);
        let reverse = cal.current_ma((-1000i16) as u16);
        assert!(forward > 0.0);
        assert!((forward + reverse).abs() < 1e-9);
        assert!((forward - 1000.0 * 3.0 / 32768.0 * 1000.0).abs() < 1e-9);
    }

    #[test]
    fn opening_missing_bus_reports_path() {
        let err = Ina219::open(250, 0x40, 0.1, 3.0).err().expect("no such bus");
        assert!(err.to_string().contains("/dev/i2c-250"));
    }
}
