//! SensorTag Payload Decoders
//!
//! Pure byte-to-physical-unit conversions for every sensor family the bridge
//! knows about. Nothing here touches the bus.

use crate::domain::models::{FieldValue, Fields};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{sensor} payload has {actual} bytes, expected {expected}")]
    Length {
        sensor: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// 16-bit codes of one vendor sensor service and its three characteristics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorCodes {
    pub service: u16,
    pub data: u16,
    pub conf: u16,
    pub period: u16,
}

/// Sensor families with the enable/await/disable measurement envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Temperature,
    Humidity,
    Pressure,
    Light,
    Motion,
}

impl SensorKind {
    pub const ALL: [SensorKind; 5] = [
        Self::Temperature,
        Self::Humidity,
        Self::Pressure,
        Self::Light,
        Self::Motion,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Pressure => "pressure",
            Self::Light => "light",
            Self::Motion => "motion",
        }
    }

    pub fn codes(self) -> SensorCodes {
        let (service, data, conf, period) = match self {
            Self::Temperature => (0xaa00, 0xaa01, 0xaa02, 0xaa03),
            Self::Humidity => (0xaa20, 0xaa21, 0xaa22, 0xaa23),
            // The pressure period characteristic skips 0xaa43
            Self::Pressure => (0xaa40, 0xaa41, 0xaa42, 0xaa44),
            Self::Light => (0xaa70, 0xaa71, 0xaa72, 0xaa73),
            Self::Motion => (0xaa80, 0xaa81, 0xaa82, 0xaa83),
        };
        SensorCodes {
            service,
            data,
            conf,
            period,
        }
    }

    /// Bytes written to the configuration characteristic to start sampling
    pub fn enable_command(self, range: AccelRange) -> Vec<u8> {
        match self {
            Self::Motion => {
                // gyro, accel and mag on all axes, range selector in the high byte
                let word = 0x007f_u16 | (u16::from(range.selector()) << 8);
                word.to_le_bytes().to_vec()
            }
            _ => vec![0x01],
        }
    }

    pub fn decode(self, raw: &[u8], range: AccelRange) -> Result<Fields, DecodeError> {
        match self {
            Self::Temperature => decode_temperature(raw),
            Self::Humidity => decode_humidity(raw),
            Self::Pressure => decode_pressure(raw),
            Self::Light => decode_light(raw),
            Self::Motion => decode_motion(raw, range),
        }
    }
}

/// Full-scale range of the motion sensor's accelerometer in G
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AccelRange {
    #[default]
    G2,
    G4,
    G8,
    G16,
}

impl AccelRange {
    pub fn g(self) -> f64 {
        match self {
            Self::G2 => 2.0,
            Self::G4 => 4.0,
            Self::G8 => 8.0,
            Self::G16 => 16.0,
        }
    }

    fn selector(self) -> u8 {
        match self {
            Self::G2 => 0,
            Self::G4 => 1,
            Self::G8 => 2,
            Self::G16 => 3,
        }
    }
}

impl TryFrom<u8> for AccelRange {
    type Error = String;

    fn try_from(g: u8) -> Result<Self, Self::Error> {
        match g {
            2 => Ok(Self::G2),
            4 => Ok(Self::G4),
            8 => Ok(Self::G8),
            16 => Ok(Self::G16),
            other => Err(format!(
                "unsupported accelerometer range {other} G (expected 2, 4, 8 or 16)"
            )),
        }
    }
}

impl From<AccelRange> for u8 {
    fn from(r: AccelRange) -> u8 {
        r.g() as u8
    }
}

/// Standard battery level payload length
pub const BATTERY_PAYLOAD_LEN: usize = 1;

/// Connection parameter payload: interval, latency, supervision timeout
pub const CONNECTION_PARAMS_LEN: usize = 6;

fn expect_len(sensor: &'static str, raw: &[u8], expected: usize) -> Result<(), DecodeError> {
    if raw.len() != expected {
        return Err(DecodeError::Length {
            sensor,
            expected,
            actual: raw.len(),
        });
    }
    Ok(())
}

fn i16_at(raw: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([raw[offset], raw[offset + 1]])
}

fn u16_at(raw: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([raw[offset], raw[offset + 1]])
}

/// Sign-extended little-endian 24-bit integer
fn i24_at(raw: &[u8], offset: usize) -> i32 {
    let v = i32::from(raw[offset])
        | i32::from(raw[offset + 1]) << 8
        | i32::from(raw[offset + 2]) << 16;
    (v << 8) >> 8
}

fn fields<const N: usize>(entries: [(&str, FieldValue); N]) -> Fields {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// IR thermopile: object and die temperature in °C
pub fn decode_temperature(raw: &[u8]) -> Result<Fields, DecodeError> {
    expect_len("temperature", raw, 4)?;
    let scale = f64::from(1 << 7);
    Ok(fields([
        ("temp_ir", (f64::from(i16_at(raw, 0)) / scale).into()),
        ("temp_die", (f64::from(i16_at(raw, 2)) / scale).into()),
    ]))
}

/// Relative humidity in % and the humidity sensor's temperature in °C
pub fn decode_humidity(raw: &[u8]) -> Result<Fields, DecodeError> {
    expect_len("humidity", raw, 4)?;
    let full_scale = f64::from(1 << 16);
    let temp = f64::from(i16_at(raw, 0)) * (165.0 / full_scale) - 40.0;
    let humidity = f64::from(u16_at(raw, 2)) * 100.0 / full_scale;
    Ok(fields([
        ("temp_rh", temp.into()),
        ("humidity", humidity.into()),
    ]))
}

/// Barometer temperature in °C and pressure in hPa
pub fn decode_pressure(raw: &[u8]) -> Result<Fields, DecodeError> {
    expect_len("pressure", raw, 6)?;
    Ok(fields([
        ("temp_p", (f64::from(i24_at(raw, 0)) / 100.0).into()),
        ("pressure", (f64::from(i24_at(raw, 3)) / 100.0).into()),
    ]))
}

/// Optical sensor, 12-bit mantissa with a 4-bit exponent
pub fn decode_light(raw: &[u8]) -> Result<Fields, DecodeError> {
    expect_len("light", raw, 2)?;
    let v = u32::from(u16_at(raw, 0));
    let lux = 0.01 * f64::from((v & 0x0fff) << (v >> 12));
    Ok(fields([("lux", lux.into())]))
}

/// Nine-axis motion: gyro in deg/s, accelerometer in G, magnetometer in µT
pub fn decode_motion(raw: &[u8], range: AccelRange) -> Result<Fields, DecodeError> {
    expect_len("motion", raw, 18)?;
    let full_scale = f64::from(1 << 15);
    let v: Vec<f64> = (0..9).map(|i| f64::from(i16_at(raw, 2 * i))).collect();
    let gyro = |x: f64| FieldValue::Float(x * 250.0 / full_scale);
    let acc = |x: f64| FieldValue::Float(x * range.g() / full_scale);
    Ok(fields([
        ("gyro_x", gyro(v[0])),
        ("gyro_y", gyro(v[1])),
        ("gyro_z", gyro(v[2])),
        ("acc_x", acc(v[3])),
        ("acc_y", acc(v[4])),
        ("acc_z", acc(v[5])),
        ("mag_x", v[6].into()),
        ("mag_y", v[7].into()),
        ("mag_z", v[8].into()),
    ]))
}

pub fn decode_battery(raw: &[u8]) -> Result<Fields, DecodeError> {
    expect_len("battery", raw, BATTERY_PAYLOAD_LEN)?;
    Ok(fields([("battery_level", i64::from(raw[0]).into())]))
}

/// Current connection parameters in link-layer units
pub fn decode_connection_params(raw: &[u8]) -> Result<Fields, DecodeError> {
    expect_len("connection parameters", raw, CONNECTION_PARAMS_LEN)?;
    Ok(fields([
        ("interval", i64::from(u16_at(raw, 0)).into()),
        ("latency", i64::from(u16_at(raw, 2)).into()),
        ("timeout", i64::from(u16_at(raw, 4)).into()),
    ]))
}

/// Connection parameter update request.
///
/// Intervals are in 1.25 ms units, the supervision timeout in 10 ms units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    pub timeout: u16,
}

impl ConnectionRequest {
    pub fn encode(&self) -> Vec<u8> {
        [self.interval_min, self.interval_max, self.latency, self.timeout]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect()
    }
}

impl Default for ConnectionRequest {
    /// 380-400 ms interval, no slave latency, 6 s supervision timeout
    fn default() -> Self {
        Self {
            interval_min: 304,
            interval_max: 320,
            latency: 0,
            timeout: 600,
        }
    }
}
