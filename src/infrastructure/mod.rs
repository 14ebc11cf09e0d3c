pub mod bluez;
pub mod logging;
pub mod sensortag;
pub mod shutdown;
pub mod telemetry;
