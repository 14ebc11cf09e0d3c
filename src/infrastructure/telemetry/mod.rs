//! Telemetry Module
//!
//! Encodes readings as InfluxDB line protocol and ships them over UDP.

pub mod line_protocol;
pub mod udp;

use crate::domain::models::Reading;

/// Destination for the readings of a measurement round
#[allow(async_fn_in_trait)]
pub trait ReadingSink {
    async fn publish(&self, readings: &[Reading]);
}
