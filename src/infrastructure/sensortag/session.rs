//! Device Session
//!
//! Drives one tag through connect, GATT resolution and measurement rounds.
//! Property signals from the device object feed [`DeviceSession::spawn_event_loop`];
//! everything runs on the local task set, so state lives in `Cell`/`RefCell`.

use crate::domain::models::{Fields, Reading, SessionState};
use crate::domain::sensors::{AccelRange, ConnectionRequest, SensorKind};
use crate::domain::settings::FleetSettings;
use crate::infrastructure::bluez::bus::{Bus, BusError, PropertiesChanged, DEVICE};
use crate::infrastructure::bluez::objects::Device;
use crate::infrastructure::sensortag::bindings::{BatteryLevel, ConnectionControl, SensorBinding};
use crate::infrastructure::sensortag::error::SessionError;
use crate::infrastructure::sensortag::protocol::{ti_uuid128, ServiceRegistry, ServiceRole};
use crate::infrastructure::shutdown::StopSignal;
use futures::future::join_all;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use tracing::{debug, info, trace, warn};

/// Per-tag options taken from the fleet settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub min_rssi: i16,
    pub sensors: Vec<SensorKind>,
    pub measure_battery: bool,
    pub acc_range: AccelRange,
    pub connection_request: ConnectionRequest,
}

impl From<&FleetSettings> for SessionConfig {
    fn from(settings: &FleetSettings) -> Self {
        Self {
            min_rssi: settings.min_rssi,
            sensors: settings.sensors.clone(),
            measure_battery: settings.measure_battery,
            acc_range: settings.motion_acc_range,
            connection_request: ConnectionRequest::default(),
        }
    }
}

/// Holds a flag for its lifetime; a second acquire fails while it is held
struct FlightGuard<'a>(&'a Cell<bool>);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a Cell<bool>) -> Option<Self> {
        if flag.replace(true) {
            return None;
        }
        Some(Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Puts a measuring session back to armed however the round ends
struct MeasuringGuard<'a>(&'a Cell<SessionState>);

impl Drop for MeasuringGuard<'_> {
    fn drop(&mut self) {
        if self.0.get() == SessionState::Measuring {
            self.0.set(SessionState::Armed);
        }
    }
}

struct Bindings<B> {
    address: String,
    sensors: Vec<Rc<SensorBinding<B>>>,
    battery: Option<Rc<BatteryLevel<B>>>,
}

pub struct DeviceSession<B> {
    device: Device<B>,
    config: Rc<SessionConfig>,
    registry: Rc<ServiceRegistry>,
    state: Cell<SessionState>,
    connecting: Cell<bool>,
    resolving: Cell<bool>,
    bindings: RefCell<Option<Bindings<B>>>,
}

impl<B: Bus + 'static> DeviceSession<B> {
    pub async fn attach(
        bus: Rc<B>,
        path: &str,
        config: Rc<SessionConfig>,
        registry: Rc<ServiceRegistry>,
    ) -> Result<Rc<Self>, BusError> {
        let device = Device::attach(bus, path).await?;
        Ok(Rc::new(Self {
            device,
            config,
            registry,
            state: Cell::new(SessionState::Discovered),
            connecting: Cell::new(false),
            resolving: Cell::new(false),
            bindings: RefCell::new(None),
        }))
    }

    pub fn path(&self) -> &str {
        self.device.path()
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    fn set_state(&self, state: SessionState) {
        let old = self.state.replace(state);
        if old != state {
            debug!("{}: {} -> {}", self.path(), old, state);
        }
    }

    fn ensure_present(&self) -> Result<(), SessionError> {
        if self.state() == SessionState::Gone {
            return Err(SessionError::Gone(self.path().to_string()));
        }
        Ok(())
    }

    /// Connects unless connected or already connecting, then resolves the
    /// GATT tree if BlueZ reports it ready.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.ensure_present()?;
        if !self.device.connected().await? {
            let Some(_connecting) = FlightGuard::acquire(&self.connecting) else {
                debug!("{}: connect already in flight", self.path());
                return Ok(());
            };
            self.set_state(SessionState::Connecting);
            info!("Connecting to {}", self.path());
            if let Err(e) = self.device.connect().await {
                if self.state() == SessionState::Connecting {
                    self.set_state(SessionState::Discovered);
                }
                return Err(e.into());
            }
            info!("Connected to {}", self.path());
            self.ensure_present()?;
            self.set_state(SessionState::Connected);
        } else if matches!(
            self.state(),
            SessionState::Discovered | SessionState::Connecting
        ) {
            self.set_state(SessionState::Connected);
        }

        // an armed tag is re-resolved only on a fresh ServicesResolved signal
        if self.state() == SessionState::Connected && self.device.services_resolved().await? {
            self.populate().await?;
        }
        Ok(())
    }

    /// Binds every known service and arms the sensors.
    ///
    /// On failure the tag stays connected but unmeasured until the next
    /// resolution signal retries.
    pub async fn populate(&self) -> Result<(), SessionError> {
        self.ensure_present()?;
        let Some(_resolving) = FlightGuard::acquire(&self.resolving) else {
            debug!("{}: resolution already in flight", self.path());
            return Ok(());
        };
        self.set_state(SessionState::Resolving);
        match self.resolve().await {
            Ok(bindings) => {
                if self.state() != SessionState::Resolving {
                    // disconnected or removed while resolving
                    return Ok(());
                }
                info!(
                    "{} ({}) armed with {} sensor(s)",
                    self.path(),
                    bindings.address,
                    bindings.sensors.len()
                );
                *self.bindings.borrow_mut() = Some(bindings);
                self.set_state(SessionState::Armed);
                Ok(())
            }
            Err(e) => {
                self.bindings.borrow_mut().take();
                if self.state() == SessionState::Resolving {
                    self.set_state(SessionState::Connected);
                }
                Err(e)
            }
        }
    }

    async fn resolve(&self) -> Result<Bindings<B>, SessionError> {
        debug!("Populating {}", self.path());
        let address = self.device.address().await?;
        let objects = self.device.remote().bus().managed_objects().await?;
        let services = self.device.services(&objects).await?;

        let mut sensors = Vec::new();
        let mut battery = None;
        let mut control = None;
        for service in &services {
            let role = self.registry.lookup(&service.uuid);
            trace!("{}: {} is {:?}", self.path(), service.uuid, role);
            match role {
                Some(ServiceRole::Sensor(kind)) => {
                    sensors.push(Rc::new(SensorBinding::bind(service, kind)?));
                }
                Some(ServiceRole::Battery) => battery = Some(Rc::new(BatteryLevel::bind(service)?)),
                Some(ServiceRole::ConnectionControl) => {
                    control = Some(ConnectionControl::bind(service)?);
                }
                None => {}
            }
        }

        for kind in &self.config.sensors {
            if !sensors.iter().any(|s| s.kind == *kind) {
                return Err(SessionError::Resolution {
                    path: self.path().to_string(),
                    what: "sensor service",
                    uuid: ti_uuid128(kind.codes().service),
                });
            }
        }

        for sensor in &sensors {
            sensor.arm().await?;
        }

        if let Some(battery) = &battery {
            match battery.read().await {
                Ok(level) => info!("{}: {:?}", self.path(), level),
                Err(e) => warn!("{}: battery read failed: {}", self.path(), e),
            }
        }

        if let Some(control) = &control {
            if let Err(e) = control.apply(self.config.connection_request).await {
                warn!("{}: connection parameter request failed: {}", self.path(), e);
            }
            match control.current().await {
                Ok(params) => debug!("{}: connection parameters {:?}", self.path(), params),
                Err(e) => debug!("{}: connection parameters unavailable: {}", self.path(), e),
            }
        }

        Ok(Bindings {
            address,
            sensors,
            battery,
        })
    }

    /// Runs one measurement on an armed tag.
    ///
    /// Returns `Ok(None)` for a tag that is not ready. Every configured sensor
    /// is measured concurrently and each one is disabled again before this
    /// returns, also when `stop` fires.
    pub async fn measure(&self, stop: &StopSignal) -> Result<Option<Reading>, SessionError> {
        if self.state() != SessionState::Armed {
            return Ok(None);
        }
        if !(self.device.connected().await? && self.device.services_resolved().await?) {
            return Ok(None);
        }

        let (address, sensors, battery) = {
            let bindings = self.bindings.borrow();
            let Some(bindings) = bindings.as_ref() else {
                return Ok(None);
            };
            let sensors: Vec<_> = bindings
                .sensors
                .iter()
                .filter(|s| self.config.sensors.contains(&s.kind))
                .cloned()
                .collect();
            (bindings.address.clone(), sensors, bindings.battery.clone())
        };
        // re-checked after the property reads above suspended
        if self.state() != SessionState::Armed {
            return Ok(None);
        }

        self.set_state(SessionState::Measuring);
        let _restore = MeasuringGuard(&self.state);
        debug!("Measuring {}", self.path());

        let results = join_all(
            sensors
                .iter()
                .map(|s| s.measure(self.path(), self.config.acc_range, stop)),
        )
        .await;

        let mut fields = Fields::new();
        for result in results {
            fields.extend(result?);
        }
        if self.config.measure_battery {
            if let Some(battery) = battery {
                fields.extend(battery.read().await?);
            }
        }
        debug!("{}: {:?}", self.path(), fields);
        Ok(Some(Reading::new(address, fields)))
    }

    /// The device object was removed from the bus
    pub fn retire(&self) {
        self.bindings.borrow_mut().take();
        self.set_state(SessionState::Gone);
    }

    /// Reacts to the device's property signals until the session is dropped
    pub fn spawn_event_loop(self: &Rc<Self>) {
        let mut signals = self.device.remote().watch();
        let session = Rc::downgrade(self);
        tokio::task::spawn_local(async move {
            while let Some(signal) = signals.recv().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.on_properties_changed(&signal);
            }
        });
    }

    fn on_properties_changed(self: &Rc<Self>, signal: &PropertiesChanged) {
        if signal.interface != DEVICE || self.state() == SessionState::Gone {
            return;
        }
        for (name, value) in &signal.changed {
            debug!("{}: {} = {:?}", self.path(), name, value);
        }

        if signal.changed.get("Connected").and_then(|v| v.as_bool()) == Some(false) {
            info!("{} disconnected", self.path());
            self.bindings.borrow_mut().take();
            self.set_state(SessionState::Discovered);
        }

        if let Some(rssi) = signal.changed.get("RSSI").and_then(|v| v.as_i16()) {
            if rssi > self.config.min_rssi {
                let session = Rc::clone(self);
                spawn_logged(self.path(), "start", async move { session.start().await });
            }
        }

        if signal.changed.get("ServicesResolved").and_then(|v| v.as_bool()) == Some(true) {
            let session = Rc::clone(self);
            spawn_logged(self.path(), "populate", async move { session.populate().await });
        }
    }
}

/// Runs `task` on the local set and logs its failure
pub fn spawn_logged<F>(path: &str, what: &'static str, task: F)
where
    F: Future<Output = Result<(), SessionError>> + 'static,
{
    let path = path.to_string();
    tokio::task::spawn_local(async move {
        match task.await {
            Ok(()) => {}
            Err(SessionError::Gone(_)) => debug!("{}: {} abandoned, tag removed", path, what),
            Err(e) => warn!("{}: {} failed: {}", path, what, e),
        }
    });
}
