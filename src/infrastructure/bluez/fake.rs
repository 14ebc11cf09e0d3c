//! Scripted in-memory [`Bus`] for tests.
//!
//! Holds a mutable object tree, records every method call and lets tests hook
//! reactions (signals, failures) onto specific calls.

use crate::domain::sensors::SensorKind;
use crate::infrastructure::bluez::bus::{
    Bus, BusError, InterfaceMap, ManagedObjects, Method, ObjectEvent, Properties,
    PropertiesChanged, Value, ADAPTER, CHARACTERISTIC, DEVICE, SERVICE,
};
use crate::infrastructure::sensortag::protocol::{
    ble_uuid128, ti_uuid128, BATTERY_LEVEL_CHAR, BATTERY_SERVICE, CONNECTION_CONTROL,
};
use futures::stream::{self, LocalBoxStream, StreamExt};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::mpsc;

type Reaction = Box<dyn Fn(&FakeBus, &str, &Method) -> Option<Result<Value, BusError>>>;

#[derive(Default)]
struct State {
    objects: RefCell<ManagedObjects>,
    signal_subscribers: RefCell<HashMap<String, Vec<mpsc::UnboundedSender<PropertiesChanged>>>>,
    object_subscribers: RefCell<Vec<mpsc::UnboundedSender<ObjectEvent>>>,
    calls: RefCell<Vec<(String, Method)>>,
    reactions: RefCell<Vec<Reaction>>,
    call_latency: Cell<Duration>,
}

#[derive(Clone, Default)]
pub struct FakeBus {
    state: Rc<State>,
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every method call suspends for this long before completing
    pub fn set_call_latency(&self, latency: Duration) {
        self.state.call_latency.set(latency);
    }

    pub fn add_object(&self, path: &str, interface: &str, props: Properties) {
        self.state
            .objects
            .borrow_mut()
            .entry(path.to_string())
            .or_default()
            .insert(interface.to_string(), props);
    }

    pub fn remove_object(&self, path: &str) {
        let removed = self.state.objects.borrow_mut().remove(path);
        if let Some(interfaces) = removed {
            self.announce(ObjectEvent::Removed {
                path: path.to_string(),
                interfaces: interfaces.into_keys().collect(),
            });
        }
    }

    pub fn announce(&self, event: ObjectEvent) {
        self.state
            .object_subscribers
            .borrow_mut()
            .retain(|s| s.send(event.clone()).is_ok());
    }

    pub fn property(&self, path: &str, interface: &str, name: &str) -> Option<Value> {
        self.state
            .objects
            .borrow()
            .get(path)?
            .get(interface)?
            .get(name)
            .cloned()
    }

    /// Updates a property and emits the matching change signal
    pub fn update(&self, path: &str, interface: &str, name: &str, value: Value) {
        if let Some(props) = self
            .state
            .objects
            .borrow_mut()
            .get_mut(path)
            .and_then(|o| o.get_mut(interface))
        {
            props.insert(name.to_string(), value.clone());
        }
        let mut changed = Properties::new();
        changed.insert(name.to_string(), value);
        self.emit(
            path,
            PropertiesChanged {
                interface: interface.to_string(),
                changed,
                invalidated: Vec::new(),
            },
        );
    }

    pub fn emit(&self, path: &str, signal: PropertiesChanged) {
        if let Some(subs) = self.state.signal_subscribers.borrow_mut().get_mut(path) {
            subs.retain(|s| s.send(signal.clone()).is_ok());
        }
    }

    /// Emits a characteristic `Value` change after `delay`
    pub fn notify_later(&self, path: &str, bytes: Vec<u8>, delay: Duration) {
        let bus = self.clone();
        let path = path.to_string();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            bus.update(&path, CHARACTERISTIC, "Value", Value::Bytes(bytes));
        });
    }

    /// Registers a reaction consulted on every call; the first one returning
    /// `Some` decides the call's result
    pub fn on_call(
        &self,
        reaction: impl Fn(&FakeBus, &str, &Method) -> Option<Result<Value, BusError>> + 'static,
    ) {
        self.state.reactions.borrow_mut().push(Box::new(reaction));
    }

    pub fn calls(&self) -> Vec<(String, Method)> {
        self.state.calls.borrow().clone()
    }

    pub fn count_calls(&self, path: &str, method: &Method) -> usize {
        self.state
            .calls
            .borrow()
            .iter()
            .filter(|(p, m)| p == path && m == method)
            .count()
    }

    pub fn add_adapter(&self, path: &str, powered: bool) {
        let mut props = Properties::new();
        props.insert("Powered".into(), Value::Bool(powered));
        props.insert("Discovering".into(), Value::Bool(false));
        self.add_object(path, ADAPTER, props);
    }

    /// Adds a tag advertising the motion service plus the GATT tree for `kinds`,
    /// the battery service and the connection control service
    pub fn add_sensortag(&self, device: &str, address: &str, kinds: &[SensorKind]) {
        let mut props = Properties::new();
        props.insert("Connected".into(), Value::Bool(false));
        props.insert("ServicesResolved".into(), Value::Bool(false));
        props.insert("Address".into(), Value::Str(address.to_string()));
        props.insert("RSSI".into(), Value::I16(-60));
        props.insert(
            "UUIDs".into(),
            Value::StrList(vec![ti_uuid128(SensorKind::Motion.codes().service).to_string()]),
        );
        self.add_object(device, DEVICE, props);

        for kind in kinds {
            let c = kind.codes();
            let service = format!("{device}/service{:04x}", c.service);
            self.add_service(&service, device, &ti_uuid128(c.service).to_string());
            for code in [c.data, c.conf, c.period] {
                self.add_characteristic(
                    &format!("{service}/char{code:04x}"),
                    &service,
                    &ti_uuid128(code).to_string(),
                );
            }
        }

        let battery = format!("{device}/service180f");
        self.add_service(&battery, device, &ble_uuid128(BATTERY_SERVICE).to_string());
        let level = format!("{battery}/char2a19");
        self.add_characteristic(&level, &battery, &ble_uuid128(BATTERY_LEVEL_CHAR).to_string());
        self.update(&level, CHARACTERISTIC, "Value", Value::Bytes(vec![90]));

        let cc = CONNECTION_CONTROL;
        let control = format!("{device}/service{:04x}", cc.service);
        self.add_service(&control, device, &ti_uuid128(cc.service).to_string());
        for code in [cc.current, cc.request, cc.disconnect] {
            self.add_characteristic(
                &format!("{control}/char{code:04x}"),
                &control,
                &ti_uuid128(code).to_string(),
            );
        }
    }

    pub fn add_service(&self, path: &str, device: &str, uuid: &str) {
        let mut props = Properties::new();
        props.insert("UUID".into(), Value::Str(uuid.to_string()));
        props.insert("Device".into(), Value::Path(device.to_string()));
        props.insert("Primary".into(), Value::Bool(true));
        self.add_object(path, SERVICE, props);
    }

    pub fn add_characteristic(&self, path: &str, service: &str, uuid: &str) {
        let mut props = Properties::new();
        props.insert("UUID".into(), Value::Str(uuid.to_string()));
        props.insert("Service".into(), Value::Path(service.to_string()));
        props.insert("Notifying".into(), Value::Bool(false));
        props.insert("Value".into(), Value::Bytes(Vec::new()));
        self.add_object(path, CHARACTERISTIC, props);
    }

    fn exists(&self, path: &str) -> bool {
        self.state.objects.borrow().contains_key(path)
    }
}

impl Bus for FakeBus {
    async fn managed_objects(&self) -> Result<ManagedObjects, BusError> {
        tokio::task::yield_now().await;
        Ok(self.state.objects.borrow().clone())
    }

    async fn get_property(
        &self,
        path: &str,
        interface: &str,
        name: &str,
    ) -> Result<Value, BusError> {
        tokio::task::yield_now().await;
        if !self.exists(path) {
            return Err(BusError::ObjectGone(path.to_string()));
        }
        self.property(path, interface, name)
            .ok_or_else(|| BusError::transport(path, format!("Get {name}"), "no such property"))
    }

    async fn set_property(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        value: Value,
    ) -> Result<(), BusError> {
        tokio::task::yield_now().await;
        if !self.exists(path) {
            return Err(BusError::ObjectGone(path.to_string()));
        }
        self.update(path, interface, name, value);
        Ok(())
    }

    async fn call(&self, path: &str, method: Method) -> Result<Value, BusError> {
        self.state
            .calls
            .borrow_mut()
            .push((path.to_string(), method.clone()));
        let latency = self.state.call_latency.get();
        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }
        if !self.exists(path) {
            return Err(BusError::ObjectGone(path.to_string()));
        }

        let reacted = self
            .state
            .reactions
            .borrow()
            .iter()
            .find_map(|r| r(self, path, &method));
        if let Some(result) = reacted {
            return result;
        }

        match &method {
            Method::Connect => {
                self.update(path, DEVICE, "Connected", Value::Bool(true));
                Ok(Value::Unit)
            }
            Method::StartNotify => {
                self.update(path, CHARACTERISTIC, "Notifying", Value::Bool(true));
                Ok(Value::Unit)
            }
            Method::StopNotify => {
                self.update(path, CHARACTERISTIC, "Notifying", Value::Bool(false));
                Ok(Value::Unit)
            }
            Method::ReadValue => Ok(self
                .property(path, CHARACTERISTIC, "Value")
                .unwrap_or(Value::Bytes(Vec::new()))),
            Method::StartDiscovery => {
                self.update(path, ADAPTER, "Discovering", Value::Bool(true));
                Ok(Value::Unit)
            }
            Method::StopDiscovery => {
                self.update(path, ADAPTER, "Discovering", Value::Bool(false));
                Ok(Value::Unit)
            }
            _ => Ok(Value::Unit),
        }
    }

    async fn property_changes(
        &self,
        path: &str,
    ) -> Result<LocalBoxStream<'static, PropertiesChanged>, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .signal_subscribers
            .borrow_mut()
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok(receiver_stream(rx))
    }

    async fn object_events(&self) -> Result<LocalBoxStream<'static, ObjectEvent>, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.object_subscribers.borrow_mut().push(tx);
        Ok(receiver_stream(rx))
    }
}

/// Builds the interface map announced with `InterfacesAdded` for `path`
pub fn interfaces_of(bus: &FakeBus, path: &str) -> InterfaceMap {
    bus.state
        .objects
        .borrow()
        .get(path)
        .cloned()
        .unwrap_or_default()
}

fn receiver_stream<T: 'static>(rx: mpsc::UnboundedReceiver<T>) -> LocalBoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed_local()
}
