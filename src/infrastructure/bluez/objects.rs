//! BlueZ Object Model
//!
//! Typed views over adapters, devices, GATT services and characteristics.
//! Each view owns one [`RemoteObject`] and therefore one signal subscription.

use crate::infrastructure::bluez::bus::{
    Bus, BusError, DiscoveryFilter, ManagedObjects, Method, Properties, Value, ADAPTER,
    CHARACTERISTIC, DEVICE, SERVICE,
};
use crate::infrastructure::bluez::remote::{PropertyChange, RemoteObject};
use std::rc::Rc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Objects strictly below `parent` implementing `interface`, in path order
pub fn children<'a>(
    objects: &'a ManagedObjects,
    parent: &str,
    interface: &'a str,
) -> impl Iterator<Item = (&'a str, &'a Properties)> + 'a {
    let prefix = format!("{}/", parent.trim_end_matches('/'));
    objects.iter().filter_map(move |(path, interfaces)| {
        if !path.starts_with(&prefix) {
            return None;
        }
        interfaces
            .get(interface)
            .map(|props| (path.as_str(), props))
    })
}

fn uuid_property(path: &str, props: &Properties) -> Option<Uuid> {
    let raw = props.get("UUID").and_then(Value::as_str)?;
    match Uuid::parse_str(raw) {
        Ok(uuid) => Some(uuid),
        Err(e) => {
            warn!("Ignoring {} with malformed UUID {:?}: {}", path, raw, e);
            None
        }
    }
}

pub struct Adapter<B> {
    obj: RemoteObject<B>,
}

impl<B: Bus + 'static> Adapter<B> {
    pub async fn attach(bus: Rc<B>, path: &str) -> Result<Self, BusError> {
        Ok(Self {
            obj: RemoteObject::attach(bus, path).await?,
        })
    }

    pub fn path(&self) -> &str {
        self.obj.path()
    }

    pub async fn powered(&self) -> Result<bool, BusError> {
        self.obj.get_bool(ADAPTER, "Powered").await
    }

    pub async fn set_powered(&self, on: bool) -> Result<(), BusError> {
        self.obj.set(ADAPTER, "Powered", Value::Bool(on)).await
    }

    pub async fn discovering(&self) -> Result<bool, BusError> {
        self.obj.get_bool(ADAPTER, "Discovering").await
    }

    pub async fn set_discovery_filter(&self, filter: DiscoveryFilter) -> Result<(), BusError> {
        self.obj.call(Method::SetDiscoveryFilter(filter)).await?;
        Ok(())
    }

    pub async fn start_discovery(&self) -> Result<(), BusError> {
        self.obj.call(Method::StartDiscovery).await?;
        Ok(())
    }

    pub async fn stop_discovery(&self) -> Result<(), BusError> {
        self.obj.call(Method::StopDiscovery).await?;
        Ok(())
    }
}

/// A remote BLE peripheral
pub struct Device<B> {
    obj: RemoteObject<B>,
}

impl<B> Clone for Device<B> {
    fn clone(&self) -> Self {
        Self {
            obj: self.obj.clone(),
        }
    }
}

impl<B: Bus + 'static> Device<B> {
    pub async fn attach(bus: Rc<B>, path: &str) -> Result<Self, BusError> {
        Ok(Self {
            obj: RemoteObject::attach(bus, path).await?,
        })
    }

    pub fn path(&self) -> &str {
        self.obj.path()
    }

    pub fn remote(&self) -> &RemoteObject<B> {
        &self.obj
    }

    pub async fn connected(&self) -> Result<bool, BusError> {
        self.obj.get_bool(DEVICE, "Connected").await
    }

    pub async fn services_resolved(&self) -> Result<bool, BusError> {
        self.obj.get_bool(DEVICE, "ServicesResolved").await
    }

    pub async fn address(&self) -> Result<String, BusError> {
        self.obj.get_string(DEVICE, "Address").await
    }

    pub async fn rssi(&self) -> Result<i16, BusError> {
        let value = self.obj.get(DEVICE, "RSSI").await?;
        value.as_i16().ok_or_else(|| self.obj.unexpected("RSSI", value))
    }

    pub async fn connect(&self) -> Result<(), BusError> {
        self.obj.call(Method::Connect).await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), BusError> {
        self.obj.call(Method::Disconnect).await?;
        Ok(())
    }

    /// GATT services found under this device in `objects`, with their
    /// characteristics
    pub async fn services(&self, objects: &ManagedObjects) -> Result<Vec<Service<B>>, BusError> {
        let mut services = Vec::new();
        for (path, props) in children(objects, self.path(), SERVICE) {
            let Some(uuid) = uuid_property(path, props) else {
                continue;
            };
            debug!("Service {} {}", path, uuid);
            let mut characteristics = Vec::new();
            for (char_path, char_props) in children(objects, path, CHARACTERISTIC) {
                if let Some(char_uuid) = uuid_property(char_path, char_props) {
                    characteristics.push(
                        Characteristic::attach(Rc::clone(self.obj.bus()), char_path, char_uuid)
                            .await?,
                    );
                }
            }
            services.push(Service {
                obj: RemoteObject::attach(Rc::clone(self.obj.bus()), path).await?,
                uuid,
                characteristics,
            });
        }
        Ok(services)
    }
}

pub struct Service<B> {
    obj: RemoteObject<B>,
    pub uuid: Uuid,
    pub characteristics: Vec<Characteristic<B>>,
}

impl<B> Service<B> {
    pub fn path(&self) -> &str {
        self.obj.path()
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic<B>> {
        self.characteristics.iter().find(|c| &c.uuid == uuid)
    }
}

pub struct Characteristic<B> {
    obj: RemoteObject<B>,
    pub uuid: Uuid,
}

impl<B> Clone for Characteristic<B> {
    fn clone(&self) -> Self {
        Self {
            obj: self.obj.clone(),
            uuid: self.uuid,
        }
    }
}

impl<B> Characteristic<B> {
    pub fn path(&self) -> &str {
        self.obj.path()
    }

    /// Next notified value
    pub fn value_changed(&self) -> PropertyChange {
        self.obj.changed("Value")
    }
}

impl<B: Bus + 'static> Characteristic<B> {
    pub async fn attach(bus: Rc<B>, path: &str, uuid: Uuid) -> Result<Self, BusError> {
        Ok(Self {
            obj: RemoteObject::attach(bus, path).await?,
            uuid,
        })
    }

    pub async fn read_value(&self) -> Result<Vec<u8>, BusError> {
        match self.obj.call(Method::ReadValue).await? {
            Value::Bytes(b) => Ok(b),
            other => Err(self.obj.unexpected("Value", other)),
        }
    }

    pub async fn write_value(&self, bytes: Vec<u8>) -> Result<(), BusError> {
        self.obj.call(Method::WriteValue(bytes)).await?;
        Ok(())
    }

    pub async fn notifying(&self) -> Result<bool, BusError> {
        self.obj.get_bool(CHARACTERISTIC, "Notifying").await
    }

    pub async fn start_notify(&self) -> Result<(), BusError> {
        self.obj.call(Method::StartNotify).await?;
        Ok(())
    }

    pub async fn stop_notify(&self) -> Result<(), BusError> {
        self.obj.call(Method::StopNotify).await?;
        Ok(())
    }

    /// Starts notifications unless they are already on.
    ///
    /// Not atomic against a concurrent caller; BlueZ treats a repeated
    /// StartNotify as a no-op.
    pub async fn start_notify_if_idle(&self) -> Result<(), BusError> {
        if self.notifying().await? {
            return Ok(());
        }
        self.start_notify().await
    }
}
