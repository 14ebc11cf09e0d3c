use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Decoded measurement fields, ordered by name so encoded lines are stable.
pub type Fields = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Text(String),
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

/// One measurement round's output for a single tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub address: String,
    /// Nanoseconds since the Unix epoch
    pub timestamp_ns: i64,
    pub fields: Fields,
}

impl Reading {
    pub fn new(address: impl Into<String>, fields: Fields) -> Self {
        Self {
            address: address.into(),
            timestamp_ns: now_ns(),
            fields,
        }
    }
}

pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Lifecycle of a tag as seen by its session controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Discovered,
    Connecting,
    /// Link is up but the GATT tree has not been resolved yet
    Connected,
    Resolving,
    Armed,
    Measuring,
    Gone,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Discovered => "discovered",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Resolving => "resolving",
            Self::Armed => "armed",
            Self::Measuring => "measuring",
            Self::Gone => "gone",
        };
        f.write_str(s)
    }
}
