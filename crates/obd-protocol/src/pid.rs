//! OBD-II PID Definitions and Decoding Formulas
//!
//! The decoder table maps a Mode 01 PID to its canonical metric name, its unit
//! and a fixed formula over a fixed-length payload. A payload of the wrong
//! length is always rejected; it is never truncated or zero-padded.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Standard OBD-II PIDs for Mode 01 (current data) with a registered decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Pid {
    /// Monitor status since DTCs cleared (0x01), 4-byte bitmap
    MonitorStatus = 0x01,
    /// Calculated engine load (0x04)
    EngineLoad = 0x04,
    /// Engine coolant temperature (0x05)
    CoolantTemp = 0x05,
    /// Short-term fuel trim bank 1 (0x06)
    ShortFuelTrim = 0x06,
    /// Long-term fuel trim bank 1 (0x07)
    LongFuelTrim = 0x07,
    /// Fuel rail gauge pressure (0x0A)
    FuelPressure = 0x0A,
    /// Intake manifold absolute pressure (0x0B)
    IntakeManifoldPressure = 0x0B,
    /// Engine RPM (0x0C)
    Rpm = 0x0C,
    /// Vehicle speed (0x0D)
    Speed = 0x0D,
    /// Intake air temperature (0x0F)
    IntakeAirTemp = 0x0F,
    /// Mass air flow rate (0x10)
    Maf = 0x10,
    /// Throttle position (0x11)
    ThrottlePosition = 0x11,
    /// Oxygen sensor voltage bank 1, sensor 1 (0x14)
    O2Voltage = 0x14,
    /// Run time since engine start (0x1F)
    RunTime = 0x1F,
    /// Distance traveled with MIL on (0x21)
    DistanceWithMil = 0x21,
    /// Fuel tank level input (0x2F)
    FuelLevel = 0x2F,
    /// Distance traveled since codes cleared (0x31)
    DistanceSinceClear = 0x31,
    /// Absolute barometric pressure (0x33)
    BarometricPressure = 0x33,
}

impl Pid {
    /// Every PID with a registered decoder
    pub const ALL: [Pid; 18] = [
        Pid::MonitorStatus,
        Pid::EngineLoad,
        Pid::CoolantTemp,
        Pid::ShortFuelTrim,
        Pid::LongFuelTrim,
        Pid::FuelPressure,
        Pid::IntakeManifoldPressure,
        Pid::Rpm,
        Pid::Speed,
        Pid::IntakeAirTemp,
        Pid::Maf,
        Pid::ThrottlePosition,
        Pid::O2Voltage,
        Pid::RunTime,
        Pid::DistanceWithMil,
        Pid::FuelLevel,
        Pid::DistanceSinceClear,
        Pid::BarometricPressure,
    ];

    /// Look up a PID by its numeric code
    pub fn from_code(code: u8) -> Option<Pid> {
        Self::ALL.iter().copied().find(|pid| pid.as_hex() == code)
    }

    /// Look up a PID by its two-hex-digit code, case-insensitive
    pub fn from_hex(code: &str) -> Option<Pid> {
        if code.len() != 2 || !code.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u8::from_str_radix(code, 16).ok().and_then(Self::from_code)
    }

    /// Get the PID hex value
    pub fn as_hex(&self) -> u8 {
        *self as u8
    }

    /// Two uppercase hex digits, as used on the wire and in telemetry records
    pub fn code(&self) -> String {
        format!("{:02X}", self.as_hex())
    }

    /// The Mode 01 request that polls this PID, e.g. `010C`
    pub fn poll_command(&self) -> String {
        format!("{:02X}{:02X}", crate::mode::CURRENT_DATA, self.as_hex())
    }

    /// Get the number of response bytes for this PID
    pub fn response_bytes(&self) -> usize {
        match self {
            Pid::MonitorStatus => 4,
            Pid::Rpm
            | Pid::Maf
            | Pid::O2Voltage
            | Pid::RunTime
            | Pid::DistanceWithMil
            | Pid::DistanceSinceClear => 2,
            _ => 1,
        }
    }

    /// Canonical metric name
    pub fn metric_name(&self) -> &'static str {
        match self {
            Pid::MonitorStatus => "monitor_status",
            Pid::EngineLoad => "engine_load",
            Pid::CoolantTemp => "coolant_temperature",
            Pid::ShortFuelTrim => "short_term_fuel_trim_1",
            Pid::LongFuelTrim => "long_term_fuel_trim_1",
            Pid::FuelPressure => "fuel_pressure",
            Pid::IntakeManifoldPressure => "intake_manifold_pressure",
            Pid::Rpm => "engine_rpm",
            Pid::Speed => "vehicle_speed",
            Pid::IntakeAirTemp => "intake_air_temperature",
            Pid::Maf => "maf_air_flow_rate",
            Pid::ThrottlePosition => "throttle_position",
            Pid::O2Voltage => "o2_sensor_voltage_1",
            Pid::RunTime => "run_time_since_start",
            Pid::DistanceWithMil => "distance_with_mil",
            Pid::FuelLevel => "fuel_level",
            Pid::DistanceSinceClear => "distance_since_codes_cleared",
            Pid::BarometricPressure => "barometric_pressure",
        }
    }

    /// Unit string
    pub fn unit(&self) -> &'static str {
        match self {
            Pid::MonitorStatus => "status",
            Pid::EngineLoad
            | Pid::ShortFuelTrim
            | Pid::LongFuelTrim
            | Pid::ThrottlePosition
            | Pid::FuelLevel => "%",
            Pid::CoolantTemp | Pid::IntakeAirTemp => "°C",
            Pid::FuelPressure | Pid::IntakeManifoldPressure | Pid::BarometricPressure => "kPa",
            Pid::Rpm => "rpm",
            Pid::Speed => "km/h",
            Pid::Maf => "g/s",
            Pid::O2Voltage => "V",
            Pid::RunTime => "s",
            Pid::DistanceWithMil | Pid::DistanceSinceClear => "km",
        }
    }

    /// Decode a payload with this PID's formula
    pub fn decode(&self, data: &[u8]) -> Result<f64, DecodeError> {
        let expected = self.response_bytes();
        if data.len() != expected {
            return Err(DecodeError::PayloadLength {
                pid: self.code(),
                expected,
                actual: data.len(),
            });
        }

        let a = data[0] as f64;
        let value = match self {
            // ((A*256)+B)/4
            Pid::Rpm => be_uint(data) / 4.0,
            // A - 40 (°C)
            Pid::CoolantTemp | Pid::IntakeAirTemp => a - 40.0,
            // A * 100 / 255 (%)
            Pid::EngineLoad | Pid::ThrottlePosition | Pid::FuelLevel => a * 100.0 / 255.0,
            // (A - 128) * 100 / 128 (%)
            Pid::ShortFuelTrim | Pid::LongFuelTrim => (a - 128.0) * 100.0 / 128.0,
            // A * 3 (kPa)
            Pid::FuelPressure => a * 3.0,
            // A (kPa, km/h)
            Pid::IntakeManifoldPressure | Pid::BarometricPressure | Pid::Speed => a,
            // ((A*256)+B) / 100 (g/s)
            Pid::Maf => be_uint(data) / 100.0,
            // A / 200 (V), B is the trim byte
            Pid::O2Voltage => a / 200.0,
            // Big-endian integer reassembly
            Pid::MonitorStatus
            | Pid::RunTime
            | Pid::DistanceWithMil
            | Pid::DistanceSinceClear => be_uint(data),
        };
        Ok(value)
    }
}

/// Reassemble big-endian bytes into an unsigned integer value
fn be_uint(data: &[u8]) -> f64 {
    data.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64) as f64
}

/// Decode a payload for a PID given as two hex digits
pub fn decode(pid: &str, payload: &[u8]) -> Result<f64, DecodeError> {
    Pid::from_hex(pid)
        .ok_or_else(|| DecodeError::UnsupportedPid(pid.to_string()))?
        .decode(payload)
}

/// Metric name for a PID, `unknown_<pid>` when nothing is registered
pub fn metric_name(pid: &str) -> Cow<'static, str> {
    match Pid::from_hex(pid) {
        Some(p) => Cow::Borrowed(p.metric_name()),
        None => Cow::Owned(format!("unknown_{}", pid)),
    }
}

/// Unit for a PID, `unknown` when nothing is registered
pub fn metric_unit(pid: &str) -> &'static str {
    Pid::from_hex(pid).map(|p| p.unit()).unwrap_or("unknown")
}
