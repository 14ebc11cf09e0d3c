//! BlueZ Module
//!
//! Async access to the BlueZ object tree over D-Bus.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │        Adapter / Device / Service / Characteristic    │
//! │            (typed views, one object path each)        │
//! └──────────────────────────┬───────────────────────────┘
//!                            │
//!                            ▼
//!                   ┌─────────────────┐
//!                   │  RemoteObject   │
//!                   │ - method calls  │
//!                   │ - change waiters│
//!                   └────────┬────────┘
//!                            │
//!                            ▼
//!                   ┌─────────────────┐
//!                   │   trait Bus     │
//!                   └───┬─────────┬───┘
//!                       │         │
//!                       ▼         ▼
//!                 ┌─────────┐ ┌─────────┐
//!                 │ DbusBus │ │ FakeBus │
//!                 │ (zbus)  │ │ (tests) │
//!                 └─────────┘ └─────────┘
//! ```
//!
//! ## Modules
//!
//! - [`bus`] - Transport trait, value model and errors
//! - [`dbus`] - System bus backend
//! - [`remote`] - Per-object call and signal bridge
//! - [`objects`] - Typed BlueZ objects

pub mod bus;
pub mod dbus;
#[cfg(test)]
pub mod fake;
pub mod objects;
pub mod remote;
