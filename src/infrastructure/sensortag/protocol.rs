//! SensorTag Protocol
//!
//! GATT identifiers and fixed command bytes of the TI SensorTag CC2650.

use crate::domain::sensors::SensorKind;
use std::collections::HashMap;
use uuid::Uuid;

/// Low 96 bits of the Bluetooth SIG base UUID `0000xxxx-0000-1000-8000-00805f9b34fb`
const SIG_BASE: u128 = 0x0000_1000_8000_0080_5f9b_34fb;

/// Low 96 bits of the TI vendor base UUID `f000xxxx-0451-4000-b000-000000000000`
const TI_BASE: u128 = 0x0451_4000_b000_0000_0000_0000;

/// Expands a 16-bit SIG assigned number
pub fn ble_uuid128(code: u16) -> Uuid {
    Uuid::from_u128(u128::from(code) << 96 | SIG_BASE)
}

/// Expands a 16-bit TI vendor code
pub fn ti_uuid128(code: u16) -> Uuid {
    Uuid::from_u128((0xf000_0000 | u128::from(code)) << 96 | TI_BASE)
}

pub const BATTERY_SERVICE: u16 = 0x180f;
pub const BATTERY_LEVEL_CHAR: u16 = 0x2a19;

#[derive(Debug, Clone, Copy)]
pub struct ConnectionControlCodes {
    pub service: u16,
    pub current: u16,
    pub request: u16,
    pub disconnect: u16,
}

pub const CONNECTION_CONTROL: ConnectionControlCodes = ConnectionControlCodes {
    service: 0xccc0,
    current: 0xccc1,
    request: 0xccc2,
    disconnect: 0xccc3,
};

/// Sampling period written to every period characteristic, in 10 ms units (2.55 s)
pub const PERIOD_BYTE: u8 = 0xff;

/// Service signatures a tag must advertise to be admitted
pub fn admission_signatures() -> Vec<Uuid> {
    let motion = SensorKind::Motion.codes().service;
    vec![ble_uuid128(motion), ti_uuid128(motion)]
}

/// What a resolved service is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    Sensor(SensorKind),
    Battery,
    ConnectionControl,
}

/// Maps service UUIDs to the role the session binds them to
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    roles: HashMap<Uuid, ServiceRole>,
}

impl ServiceRegistry {
    pub fn sensortag() -> Self {
        let mut roles: HashMap<Uuid, ServiceRole> = SensorKind::ALL
            .iter()
            .map(|k| (ti_uuid128(k.codes().service), ServiceRole::Sensor(*k)))
            .collect();
        roles.insert(ble_uuid128(BATTERY_SERVICE), ServiceRole::Battery);
        roles.insert(
            ti_uuid128(CONNECTION_CONTROL.service),
            ServiceRole::ConnectionControl,
        );
        Self { roles }
    }

    pub fn lookup(&self, uuid: &Uuid) -> Option<ServiceRole> {
        self.roles.get(uuid).copied()
    }
}
