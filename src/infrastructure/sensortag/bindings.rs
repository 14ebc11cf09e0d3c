//! Characteristic bindings of a resolved tag
//!
//! Each binding groups the characteristics one service exposes and owns the
//! command sequences for them.

use crate::domain::models::Fields;
use crate::domain::sensors::{
    decode_battery, decode_connection_params, AccelRange, ConnectionRequest, SensorKind,
};
use crate::infrastructure::bluez::bus::Bus;
use crate::infrastructure::bluez::objects::{Characteristic, Service};
use crate::infrastructure::bluez::remote::PropertyChange;
use crate::infrastructure::sensortag::error::SessionError;
use crate::infrastructure::sensortag::protocol::{
    ble_uuid128, ti_uuid128, BATTERY_LEVEL_CHAR, CONNECTION_CONTROL, PERIOD_BYTE,
};
use crate::infrastructure::shutdown::StopSignal;
use tracing::{debug, trace, warn};
use uuid::Uuid;

fn require<B>(
    service: &Service<B>,
    uuid: Uuid,
    what: &'static str,
) -> Result<Characteristic<B>, SessionError> {
    service
        .characteristic(&uuid)
        .cloned()
        .ok_or_else(|| SessionError::Resolution {
            path: service.path().to_string(),
            what,
            uuid,
        })
}

/// Pending disable command of a sensor whose measurement is in flight.
///
/// Dropped while still armed, it writes the command from a local task.
struct DisableOnDrop<B: Bus + 'static> {
    conf: Option<Characteristic<B>>,
    command: Vec<u8>,
}

impl<B: Bus + 'static> DisableOnDrop<B> {
    fn new(conf: &Characteristic<B>, command: Vec<u8>) -> Self {
        Self {
            conf: Some(conf.clone()),
            command,
        }
    }

    fn disarm(&mut self) {
        self.conf = None;
    }
}

impl<B: Bus + 'static> Drop for DisableOnDrop<B> {
    fn drop(&mut self) {
        let Some(conf) = self.conf.take() else {
            return;
        };
        let command = std::mem::take(&mut self.command);
        warn!("{}: measurement abandoned, disabling in background", conf.path());
        tokio::task::spawn_local(async move {
            if let Err(e) = conf.write_value(command).await {
                warn!("{}: background disable failed: {}", conf.path(), e);
            }
        });
    }
}

/// Data, configuration and period characteristics of one sensor service
pub struct SensorBinding<B> {
    pub kind: SensorKind,
    data: Characteristic<B>,
    conf: Characteristic<B>,
    period: Characteristic<B>,
}

impl<B: Bus + 'static> SensorBinding<B> {
    pub fn bind(service: &Service<B>, kind: SensorKind) -> Result<Self, SessionError> {
        let codes = kind.codes();
        Ok(Self {
            kind,
            data: require(service, ti_uuid128(codes.data), "data characteristic")?,
            conf: require(service, ti_uuid128(codes.conf), "configuration characteristic")?,
            period: require(service, ti_uuid128(codes.period), "period characteristic")?,
        })
    }

    /// Sets the sampling period and turns on data notifications
    pub async fn arm(&self) -> Result<(), SessionError> {
        self.period.write_value(vec![PERIOD_BYTE]).await?;
        self.data.start_notify_if_idle().await?;
        Ok(())
    }

    /// Enables the sensor, waits for the first non-zero sample and disables
    /// it again.
    ///
    /// The disable command is written on every exit after a successful enable,
    /// including when `stop` fires first. If the future itself is dropped once
    /// the enable write is issued, the disable is sent from a spawned task.
    pub async fn measure(
        &self,
        device: &str,
        range: AccelRange,
        stop: &StopSignal,
    ) -> Result<Fields, SessionError> {
        let enable = self.kind.enable_command(range);
        let disable = vec![0; enable.len()];

        // registered before enabling, the first notification cannot slip past
        let first = self.data.value_changed();
        let mut pending = DisableOnDrop::new(&self.conf, disable.clone());
        if let Err(e) = self.conf.write_value(enable).await {
            pending.disarm();
            return Err(e.into());
        }

        let sample = tokio::select! {
            biased;
            _ = stop.stopped() => Err(SessionError::Timeout {
                path: device.to_string(),
                sensor: self.kind.name(),
            }),
            sample = self.next_sample(first) => sample,
        };

        let disabled = self.conf.write_value(disable).await;
        pending.disarm();
        let raw = sample?;
        disabled?;

        self.kind
            .decode(&raw, range)
            .map_err(|source| SessionError::Decode {
                path: device.to_string(),
                source,
            })
    }

    async fn next_sample(&self, mut next: PropertyChange) -> Result<Vec<u8>, SessionError> {
        loop {
            let value = next.await?;
            match value.as_bytes() {
                Some(raw) if raw.iter().any(|b| *b != 0) => return Ok(raw.to_vec()),
                _ => trace!("{}: ignoring empty {} sample", self.data.path(), self.kind.name()),
            }
            next = self.data.value_changed();
        }
    }
}

pub struct BatteryLevel<B> {
    level: Characteristic<B>,
}

impl<B: Bus + 'static> BatteryLevel<B> {
    pub fn bind(service: &Service<B>) -> Result<Self, SessionError> {
        Ok(Self {
            level: require(service, ble_uuid128(BATTERY_LEVEL_CHAR), "battery level")?,
        })
    }

    pub async fn read(&self) -> Result<Fields, SessionError> {
        let raw = self.level.read_value().await?;
        decode_battery(&raw).map_err(|source| SessionError::Decode {
            path: self.level.path().to_string(),
            source,
        })
    }
}

/// Vendor service for reading and negotiating link parameters
pub struct ConnectionControl<B> {
    current: Characteristic<B>,
    request: Characteristic<B>,
}

impl<B: Bus + 'static> ConnectionControl<B> {
    pub fn bind(service: &Service<B>) -> Result<Self, SessionError> {
        let cc = CONNECTION_CONTROL;
        Ok(Self {
            current: require(service, ti_uuid128(cc.current), "current connection parameters")?,
            request: require(service, ti_uuid128(cc.request), "connection parameter request")?,
        })
    }

    pub async fn apply(&self, request: ConnectionRequest) -> Result<(), SessionError> {
        self.current.start_notify_if_idle().await?;
        debug!("{}: requesting {:?}", self.request.path(), request);
        self.request.write_value(request.encode()).await?;
        Ok(())
    }

    pub async fn current(&self) -> Result<Fields, SessionError> {
        let raw = self.current.read_value().await?;
        decode_connection_params(&raw).map_err(|source| SessionError::Decode {
            path: self.current.path().to_string(),
            source,
        })
    }
}
