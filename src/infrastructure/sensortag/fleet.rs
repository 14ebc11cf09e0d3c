//! Fleet Supervisor
//!
//! Keeps one [`DeviceSession`] per admitted tag, runs periodic discovery on
//! every adapter and fans measurement rounds out to all sessions.

use crate::domain::models::Reading;
use crate::domain::settings::FleetSettings;
use crate::infrastructure::bluez::bus::{
    Bus, BusError, DiscoveryFilter, InterfaceMap, ObjectEvent, Value, ADAPTER, DEVICE,
};
use crate::infrastructure::bluez::objects::Adapter;
use crate::infrastructure::sensortag::error::SessionError;
use crate::infrastructure::sensortag::protocol::{admission_signatures, ServiceRegistry};
use crate::infrastructure::sensortag::session::{spawn_logged, DeviceSession, SessionConfig};
use crate::infrastructure::shutdown::{stop_pair, StopSignal};
use crate::infrastructure::telemetry::ReadingSink;
use futures::future::join_all;
use futures::stream::{LocalBoxStream, StreamExt};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

pub struct Fleet<B> {
    bus: Rc<B>,
    settings: FleetSettings,
    config: Rc<SessionConfig>,
    registry: Rc<ServiceRegistry>,
    signatures: Vec<Uuid>,
    sessions: RefCell<BTreeMap<String, Rc<DeviceSession<B>>>>,
    /// Paths whose session is being attached
    admitting: RefCell<HashSet<String>>,
}

impl<B: Bus + 'static> Fleet<B> {
    pub fn new(bus: Rc<B>, settings: FleetSettings) -> Rc<Self> {
        Rc::new(Self {
            bus,
            config: Rc::new(SessionConfig::from(&settings)),
            settings,
            registry: Rc::new(ServiceRegistry::sensortag()),
            signatures: admission_signatures(),
            sessions: RefCell::new(BTreeMap::new()),
            admitting: RefCell::new(HashSet::new()),
        })
    }

    pub fn session(&self, path: &str) -> Option<Rc<DeviceSession<B>>> {
        self.sessions.borrow().get(path).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.borrow().len()
    }

    /// Runs until `stop` fires: admits known tags, then drives the object
    /// watcher, discovery and measurement loops.
    pub async fn run(
        self: Rc<Self>,
        sink: impl ReadingSink,
        stop: StopSignal,
    ) -> Result<(), BusError> {
        // subscribe first so nothing added during enumeration is missed
        let events = self.bus.object_events().await?;
        self.admit_existing().await?;
        info!("Tracking {} tag(s)", self.session_count());

        let watcher =
            tokio::task::spawn_local(Rc::clone(&self).watch_objects(events, stop.clone()));
        let discovery =
            tokio::task::spawn_local(Rc::clone(&self).discovery_loop(stop.clone()));
        self.measurement_loop(&sink, &stop).await;

        let _ = watcher.await;
        let _ = discovery.await;
        self.shutdown();
        Ok(())
    }

    pub async fn admit_existing(self: &Rc<Self>) -> Result<(), BusError> {
        let objects = self.bus.managed_objects().await?;
        for (path, interfaces) in &objects {
            self.maybe_admit(path, interfaces).await;
        }
        Ok(())
    }

    /// Creates and starts a session for a new device advertising one of the
    /// admission signatures
    pub async fn maybe_admit(self: &Rc<Self>, path: &str, interfaces: &InterfaceMap) {
        let Some(props) = interfaces.get(DEVICE) else {
            return;
        };
        if self.sessions.borrow().contains_key(path) || self.admitting.borrow().contains(path) {
            return;
        }
        let advertised = props
            .get("UUIDs")
            .and_then(Value::as_str_list)
            .unwrap_or_default();
        let matches = advertised.iter().any(|raw| {
            Uuid::parse_str(raw).is_ok_and(|uuid| self.signatures.contains(&uuid))
        });
        if !matches {
            trace!("Ignoring {}", path);
            return;
        }
        let rssi = props.get("RSSI").and_then(Value::as_i16);

        self.admitting.borrow_mut().insert(path.to_string());
        let attached = DeviceSession::attach(
            Rc::clone(&self.bus),
            path,
            Rc::clone(&self.config),
            Rc::clone(&self.registry),
        )
        .await;
        self.admitting.borrow_mut().remove(path);

        let session = match attached {
            Ok(session) => session,
            Err(e) => {
                warn!("Could not track {}: {}", path, e);
                return;
            }
        };
        info!("Tracking {} (RSSI {:?})", path, rssi);
        session.spawn_event_loop();
        self.sessions
            .borrow_mut()
            .insert(path.to_string(), Rc::clone(&session));

        if rssi.map_or(true, |rssi| rssi > self.settings.min_rssi) {
            spawn_logged(path, "start", async move { session.start().await });
        }
    }

    pub fn retire(&self, path: &str) {
        if let Some(session) = self.sessions.borrow_mut().remove(path) {
            info!("{} removed", path);
            session.retire();
        }
    }

    fn shutdown(&self) {
        let sessions = std::mem::take(&mut *self.sessions.borrow_mut());
        for session in sessions.values() {
            session.retire();
        }
        debug!("Released {} session(s)", sessions.len());
    }

    pub async fn watch_objects(
        self: Rc<Self>,
        mut events: LocalBoxStream<'static, ObjectEvent>,
        stop: StopSignal,
    ) {
        loop {
            let event = tokio::select! {
                _ = stop.stopped() => break,
                event = events.next() => event,
            };
            match event {
                Some(ObjectEvent::Added { path, interfaces }) => {
                    self.maybe_admit(&path, &interfaces).await;
                }
                Some(ObjectEvent::Removed { path, interfaces }) => {
                    if interfaces.iter().any(|i| i == DEVICE) {
                        self.retire(&path);
                    }
                }
                None => {
                    warn!("Object event stream closed");
                    break;
                }
            }
        }
    }

    pub async fn discovery_loop(self: Rc<Self>, stop: StopSignal) {
        while !stop.is_stopped() {
            if let Err(e) = self.discover_once(&stop).await {
                warn!("Discovery cycle failed: {}", e);
            }
            tokio::select! {
                _ = stop.stopped() => break,
                _ = tokio::time::sleep(self.settings.discover_interval()) => {}
            }
        }
        debug!("Discovery loop stopped");
    }

    /// One scan window on every adapter. An adapter that fails is skipped
    /// until the next cycle.
    pub async fn discover_once(&self, stop: &StopSignal) -> Result<(), BusError> {
        let objects = self.bus.managed_objects().await?;
        for (path, interfaces) in &objects {
            if !interfaces.contains_key(ADAPTER) {
                continue;
            }
            if let Err(e) = self.scan(path, stop).await {
                warn!("Skipping adapter {} this cycle: {}", path, e);
            }
        }
        Ok(())
    }

    async fn scan(&self, path: &str, stop: &StopSignal) -> Result<(), BusError> {
        let adapter = Adapter::attach(Rc::clone(&self.bus), path).await?;
        if !adapter.powered().await? {
            info!("Powering on {}", path);
            adapter.set_powered(true).await?;
        }
        adapter
            .set_discovery_filter(DiscoveryFilter::le(self.signatures.clone()))
            .await?;
        if adapter.discovering().await? {
            debug!("{} is already discovering", path);
            return Ok(());
        }
        debug!("Scanning on {}", path);
        adapter.start_discovery().await?;
        tokio::select! {
            _ = stop.stopped() => {}
            _ = tokio::time::sleep(self.settings.scan_window()) => {}
        }
        adapter.stop_discovery().await
    }

    /// Measures every session concurrently.
    ///
    /// At the round timeout every session is told to stop; sessions then get
    /// the cleanup grace to write their disable commands before they are
    /// abandoned.
    pub async fn measure_round(&self) -> Vec<Reading> {
        let sessions: Vec<_> = self.sessions.borrow().values().cloned().collect();
        if sessions.is_empty() {
            return Vec::new();
        }
        let (cancel, stop) = stop_pair();
        let hard_limit = self.settings.round_timeout() + self.settings.cleanup_grace();

        let round = join_all(sessions.iter().map(|session| {
            let stop = stop.clone();
            async move {
                let result = tokio::time::timeout(hard_limit, session.measure(&stop)).await;
                (session, result)
            }
        }));
        tokio::pin!(round);
        let results = tokio::select! {
            results = &mut round => results,
            _ = tokio::time::sleep(self.settings.round_timeout()) => {
                cancel.stop();
                round.await
            }
        };

        let mut readings = Vec::new();
        for (session, result) in results {
            match result {
                Ok(Ok(Some(reading))) => readings.push(reading),
                Ok(Ok(None)) => trace!("{} not ready", session.path()),
                Ok(Err(e @ SessionError::Timeout { .. })) => warn!("Timeout on {}", e),
                Ok(Err(e)) => warn!("Measurement failed: {}", e),
                Err(_) => error!(
                    "{} did not finish within the cleanup grace, disabling in background",
                    session.path()
                ),
            }
        }
        readings
    }

    pub async fn measurement_loop(&self, sink: &impl ReadingSink, stop: &StopSignal) {
        loop {
            tokio::select! {
                _ = stop.stopped() => break,
                _ = tokio::time::sleep(self.settings.measure_interval()) => {}
            }
            let readings = self.measure_round().await;
            if !readings.is_empty() {
                sink.publish(&readings).await;
            }
        }
        debug!("Measurement loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::SessionState;
    use crate::domain::sensors::SensorKind;
    use crate::infrastructure::bluez::bus::{Method, CHARACTERISTIC};
    use crate::infrastructure::bluez::fake::{interfaces_of, FakeBus};
    use crate::infrastructure::sensortag::protocol::ble_uuid128;
    use std::cell::RefCell;
    use std::time::Duration;
    use tokio::task::LocalSet;

    const TAG_A: &str = "/org/bluez/hci0/dev_A0_E6_F8_00_00_01";
    const TAG_B: &str = "/org/bluez/hci0/dev_A0_E6_F8_00_00_02";

    fn settings() -> FleetSettings {
        FleetSettings {
            sensors: vec![SensorKind::Humidity],
            round_timeout_secs: 0.05,
            cleanup_grace_secs: 0.05,
            measure_interval_secs: 0.01,
            discover_interval_secs: 0.01,
            scan_window_secs: 0.01,
            ..FleetSettings::default()
        }
    }

    /// Connect also resolves services
    fn resolve_on_connect(bus: &FakeBus) {
        bus.on_call(|bus, path, method| {
            if *method != Method::Connect {
                return None;
            }
            bus.update(path, DEVICE, "Connected", Value::Bool(true));
            bus.update(path, DEVICE, "ServicesResolved", Value::Bool(true));
            Some(Ok(Value::Unit))
        });
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_admission_requires_motion_signature() {
        LocalSet::new()
            .run_until(async {
                let bus = Rc::new(FakeBus::new());
                bus.add_sensortag(TAG_A, "A0:E6:F8:00:00:01", &[SensorKind::Humidity]);
                bus.add_sensortag(TAG_B, "A0:E6:F8:00:00:02", &[SensorKind::Humidity]);
                bus.update(
                    TAG_B,
                    DEVICE,
                    "UUIDs",
                    Value::StrList(vec![ble_uuid128(0x180f).to_string()]),
                );
                let fleet = Fleet::new(Rc::clone(&bus), settings());
                fleet.admit_existing().await.unwrap();

                assert!(fleet.session(TAG_A).is_some());
                assert!(fleet.session(TAG_B).is_none());
                // admitting twice keeps one session
                fleet.maybe_admit(TAG_A, &interfaces_of(&bus, TAG_A)).await;
                assert_eq!(fleet.session_count(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_weak_signal_defers_connect() {
        LocalSet::new()
            .run_until(async {
                let bus = Rc::new(FakeBus::new());
                bus.add_sensortag(TAG_A, "A0:E6:F8:00:00:01", &[SensorKind::Humidity]);
                bus.update(TAG_A, DEVICE, "RSSI", Value::I16(-115));
                let fleet = Fleet::new(Rc::clone(&bus), settings());
                fleet.admit_existing().await.unwrap();
                settle().await;
                assert_eq!(bus.count_calls(TAG_A, &Method::Connect), 0);

                bus.update(TAG_A, DEVICE, "RSSI", Value::I16(-70));
                settle().await;
                assert_eq!(bus.count_calls(TAG_A, &Method::Connect), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_silent_tag_does_not_block_round() {
        LocalSet::new()
            .run_until(async {
                let bus = Rc::new(FakeBus::new());
                resolve_on_connect(&bus);
                bus.add_sensortag(TAG_A, "A0:E6:F8:00:00:01", &[SensorKind::Humidity]);
                bus.add_sensortag(TAG_B, "A0:E6:F8:00:00:02", &[SensorKind::Humidity]);
                let fleet = Fleet::new(Rc::clone(&bus), settings());
                fleet.admit_existing().await.unwrap();
                settle().await;
                assert_eq!(fleet.session(TAG_A).unwrap().state(), SessionState::Armed);
                assert_eq!(fleet.session(TAG_B).unwrap().state(), SessionState::Armed);

                // only tag A ever answers
                let data_a = format!("{TAG_A}/serviceaa20/charaa21");
                bus.on_call(move |bus, path, method| {
                    if path.ends_with("charaa22") && *method == Method::WriteValue(vec![1]) {
                        let data = path.replace("charaa22", "charaa21");
                        if data.starts_with(TAG_A) {
                            bus.notify_later(&data, vec![0, 0, 0, 0x80], Duration::from_millis(2));
                        }
                    }
                    None
                });

                let readings = fleet.measure_round().await;
                assert_eq!(readings.len(), 1);
                assert_eq!(readings[0].address, "A0:E6:F8:00:00:01");

                let conf_b = format!("{TAG_B}/serviceaa20/charaa22");
                assert_eq!(bus.count_calls(&conf_b, &Method::WriteValue(vec![0])), 1);
                assert_eq!(
                    bus.property(&data_a, CHARACTERISTIC, "Value"),
                    Some(Value::Bytes(vec![0, 0, 0, 0x80]))
                );
                assert_eq!(fleet.session(TAG_B).unwrap().state(), SessionState::Armed);
            })
            .await;
    }

    #[tokio::test]
    async fn test_abandoned_tag_is_disabled_after_round() {
        LocalSet::new()
            .run_until(async {
                let bus = Rc::new(FakeBus::new());
                resolve_on_connect(&bus);
                bus.add_sensortag(TAG_A, "A0:E6:F8:00:00:01", &[SensorKind::Humidity]);
                let fleet = Fleet::new(Rc::clone(&bus), settings());
                fleet.admit_existing().await.unwrap();
                settle().await;
                assert_eq!(fleet.session(TAG_A).unwrap().state(), SessionState::Armed);

                // every call outlasts round timeout plus grace
                bus.set_call_latency(Duration::from_millis(150));
                let readings = fleet.measure_round().await;
                assert!(readings.is_empty());

                let conf = format!("{TAG_A}/serviceaa20/charaa22");
                settle().await;
                assert_eq!(bus.count_calls(&conf, &Method::WriteValue(vec![1])), 1);
                assert_eq!(bus.count_calls(&conf, &Method::WriteValue(vec![0])), 1);
                assert_eq!(fleet.session(TAG_A).unwrap().state(), SessionState::Armed);
            })
            .await;
    }

    #[tokio::test]
    async fn test_unresolvable_tag_does_not_affect_others() {
        LocalSet::new()
            .run_until(async {
                let bus = Rc::new(FakeBus::new());
                resolve_on_connect(&bus);
                bus.add_sensortag(TAG_A, "A0:E6:F8:00:00:01", &[SensorKind::Humidity]);
                // tag B lacks the humidity service entirely
                bus.add_sensortag(TAG_B, "A0:E6:F8:00:00:02", &[SensorKind::Pressure]);
                let fleet = Fleet::new(Rc::clone(&bus), settings());
                fleet.admit_existing().await.unwrap();
                settle().await;

                assert_eq!(fleet.session(TAG_A).unwrap().state(), SessionState::Armed);
                assert_eq!(fleet.session(TAG_B).unwrap().state(), SessionState::Connected);

                let data_a = format!("{TAG_A}/serviceaa20/charaa21");
                bus.notify_later(&data_a, vec![0, 0, 0, 0x80], Duration::from_millis(5));
                let readings = fleet.measure_round().await;
                assert_eq!(readings.len(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_object_events_admit_and_retire() {
        LocalSet::new()
            .run_until(async {
                let bus = Rc::new(FakeBus::new());
                let fleet = Fleet::new(Rc::clone(&bus), settings());
                let (handle, stop) = stop_pair();
                let events = bus.object_events().await.unwrap();
                let watcher =
                    tokio::task::spawn_local(Rc::clone(&fleet).watch_objects(events, stop));

                bus.add_sensortag(TAG_A, "A0:E6:F8:00:00:01", &[]);
                bus.announce(ObjectEvent::Added {
                    path: TAG_A.to_string(),
                    interfaces: interfaces_of(&bus, TAG_A),
                });
                settle().await;
                let session = fleet.session(TAG_A).unwrap();

                bus.remove_object(TAG_A);
                settle().await;
                assert!(fleet.session(TAG_A).is_none());
                assert_eq!(session.state(), SessionState::Gone);

                handle.stop();
                watcher.await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn test_discovery_skips_failing_adapter() {
        LocalSet::new()
            .run_until(async {
                let bus = Rc::new(FakeBus::new());
                bus.add_adapter("/org/bluez/hci0", false);
                bus.add_adapter("/org/bluez/hci1", true);
                bus.on_call(|_, path, method| {
                    (path == "/org/bluez/hci0" && matches!(method, Method::SetDiscoveryFilter(_)))
                        .then(|| Err(BusError::transport(path, "SetDiscoveryFilter", "not ready")))
                });
                let fleet = Fleet::new(Rc::clone(&bus), settings());
                let (_handle, stop) = stop_pair();
                fleet.discover_once(&stop).await.unwrap();

                assert_eq!(
                    bus.property("/org/bluez/hci0", ADAPTER, "Powered"),
                    Some(Value::Bool(true))
                );
                assert_eq!(bus.count_calls("/org/bluez/hci0", &Method::StartDiscovery), 0);
                assert_eq!(bus.count_calls("/org/bluez/hci1", &Method::StartDiscovery), 1);
                assert_eq!(bus.count_calls("/org/bluez/hci1", &Method::StopDiscovery), 1);
            })
            .await;
    }

    #[derive(Default)]
    struct RecordingSink {
        published: RefCell<Vec<Reading>>,
    }

    impl ReadingSink for RecordingSink {
        async fn publish(&self, readings: &[Reading]) {
            self.published.borrow_mut().extend_from_slice(readings);
        }
    }

    #[tokio::test]
    async fn test_run_publishes_until_stopped() {
        LocalSet::new()
            .run_until(async {
                let bus = Rc::new(FakeBus::new());
                resolve_on_connect(&bus);
                bus.add_adapter("/org/bluez/hci0", true);
                bus.add_sensortag(TAG_A, "A0:E6:F8:00:00:01", &[SensorKind::Humidity]);
                let data = format!("{TAG_A}/serviceaa20/charaa21");
                bus.on_call(move |bus, path, method| {
                    if path.ends_with("charaa22") && *method == Method::WriteValue(vec![1]) {
                        bus.notify_later(&data, vec![0, 0, 0, 0x80], Duration::from_millis(2));
                    }
                    None
                });

                let fleet = Fleet::new(Rc::clone(&bus), settings());
                let sink = Rc::new(RecordingSink::default());
                let (handle, stop) = stop_pair();
                let run = tokio::task::spawn_local(Rc::clone(&fleet).run(Rc::clone(&sink), stop));

                tokio::time::sleep(Duration::from_millis(150)).await;
                handle.stop();
                run.await.unwrap().unwrap();

                assert!(!sink.published.borrow().is_empty());
                assert_eq!(fleet.session_count(), 0);
            })
            .await;
    }

    impl<S: ReadingSink> ReadingSink for Rc<S> {
        async fn publish(&self, readings: &[Reading]) {
            (**self).publish(readings).await
        }
    }
}
