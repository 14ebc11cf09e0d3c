//! Bus Transport Contract
//!
//! The subset of the BlueZ D-Bus API the bridge consumes, expressed as one
//! trait so the session engine can run against the system bus or a scripted
//! in-memory bus.

use futures::stream::LocalBoxStream;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

pub const BLUEZ: &str = "org.bluez";
pub const ADAPTER: &str = "org.bluez.Adapter1";
pub const DEVICE: &str = "org.bluez.Device1";
pub const SERVICE: &str = "org.bluez.GattService1";
pub const CHARACTERISTIC: &str = "org.bluez.GattCharacteristic1";
pub const DESCRIPTOR: &str = "org.bluez.GattDescriptor1";

/// Variant shapes carried by BlueZ properties and method replies
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I16(i16),
    U16(u16),
    Str(String),
    Path(String),
    Bytes(Vec<u8>),
    StrList(Vec<String>),
    Unit,
    /// Anything else, kept as its D-Bus signature
    Other(String),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<i16> {
        match self {
            Self::I16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::Path(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str_list(&self) -> Option<&[String]> {
        match self {
            Self::StrList(l) => Some(l),
            _ => None,
        }
    }
}

pub type Properties = BTreeMap<String, Value>;
pub type InterfaceMap = BTreeMap<String, Properties>;
/// Path -> interface -> property -> value, as returned by `GetManagedObjects`
pub type ManagedObjects = BTreeMap<String, InterfaceMap>;

/// Payload of one `org.freedesktop.DBus.Properties.PropertiesChanged` signal
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertiesChanged {
    pub interface: String,
    pub changed: Properties,
    pub invalidated: Vec<String>,
}

/// Object manager signals
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEvent {
    Added {
        path: String,
        interfaces: InterfaceMap,
    },
    Removed {
        path: String,
        interfaces: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryFilter {
    pub uuids: Vec<Uuid>,
    /// "le", "bredr" or "auto"
    pub transport: &'static str,
}

impl DiscoveryFilter {
    pub fn le(uuids: Vec<Uuid>) -> Self {
        Self {
            uuids,
            transport: "le",
        }
    }
}

/// Remote operations the bridge issues, grouped by the interface owning them
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    // org.bluez.Adapter1
    SetDiscoveryFilter(DiscoveryFilter),
    StartDiscovery,
    StopDiscovery,
    // org.bluez.Device1
    Connect,
    Disconnect,
    // org.bluez.GattCharacteristic1
    ReadValue,
    WriteValue(Vec<u8>),
    StartNotify,
    StopNotify,
}

impl Method {
    pub fn interface(&self) -> &'static str {
        match self {
            Self::SetDiscoveryFilter(_) | Self::StartDiscovery | Self::StopDiscovery => ADAPTER,
            Self::Connect | Self::Disconnect => DEVICE,
            Self::ReadValue | Self::WriteValue(_) | Self::StartNotify | Self::StopNotify => {
                CHARACTERISTIC
            }
        }
    }

    pub fn member(&self) -> &'static str {
        match self {
            Self::SetDiscoveryFilter(_) => "SetDiscoveryFilter",
            Self::StartDiscovery => "StartDiscovery",
            Self::StopDiscovery => "StopDiscovery",
            Self::Connect => "Connect",
            Self::Disconnect => "Disconnect",
            Self::ReadValue => "ReadValue",
            Self::WriteValue(_) => "WriteValue",
            Self::StartNotify => "StartNotify",
            Self::StopNotify => "StopNotify",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BusError {
    #[error("{operation} on {path} failed: {message}")]
    Transport {
        path: String,
        operation: String,
        message: String,
    },
    #[error("{0} is no longer on the bus")]
    ObjectGone(String),
    #[error("{property} on {path} has unexpected value {value:?}")]
    UnexpectedType {
        path: String,
        property: String,
        value: Value,
    },
}

impl BusError {
    pub fn transport(
        path: impl Into<String>,
        operation: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        Self::Transport {
            path: path.into(),
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}

/// IPC transport consumed by the object model.
///
/// Every operation may suspend and every operation may fail: object lifetimes
/// belong to the daemon, not to this process.
#[allow(async_fn_in_trait)]
pub trait Bus {
    async fn managed_objects(&self) -> Result<ManagedObjects, BusError>;

    async fn get_property(
        &self,
        path: &str,
        interface: &str,
        name: &str,
    ) -> Result<Value, BusError>;

    async fn set_property(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        value: Value,
    ) -> Result<(), BusError>;

    async fn call(&self, path: &str, method: Method) -> Result<Value, BusError>;

    /// Property change signals emitted by one object
    async fn property_changes(
        &self,
        path: &str,
    ) -> Result<LocalBoxStream<'static, PropertiesChanged>, BusError>;

    /// Bus-wide interface added/removed signals
    async fn object_events(&self) -> Result<LocalBoxStream<'static, ObjectEvent>, BusError>;
}
