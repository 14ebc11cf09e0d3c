use crate::domain::sensors::DecodeError;
use crate::infrastructure::bluez::bus::BusError;
use thiserror::Error;
use uuid::Uuid;

/// Failures scoped to one tag. None of them stop the fleet.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] BusError),
    #[error("{path}: {what} {uuid} not found")]
    Resolution {
        path: String,
        what: &'static str,
        uuid: Uuid,
    },
    #[error("{path}: {sensor} measurement stopped before a sample arrived")]
    Timeout { path: String, sensor: &'static str },
    #[error("{path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: DecodeError,
    },
    #[error("{0} was removed")]
    Gone(String),
}
