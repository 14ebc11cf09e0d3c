//! BLE SensorTag to InfluxDB bridge.
//!
//! Discovers TI SensorTags through BlueZ, keeps a session per tag, measures
//! them in rounds and ships readings as line protocol over UDP.

pub mod domain;
pub mod infrastructure;
