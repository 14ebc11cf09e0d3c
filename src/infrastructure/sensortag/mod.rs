//! SensorTag Module
//!
//! Everything specific to TI SensorTags: GATT identifiers, characteristic
//! bindings, the per-tag session controller and the fleet supervisor.

pub mod bindings;
pub mod error;
pub mod fleet;
pub mod protocol;
pub mod session;

pub use fleet::Fleet;
