//! System bus backend
//!
//! Implements [`Bus`] on top of `zbus`, talking to `org.bluez`.

use crate::infrastructure::bluez::bus::{
    Bus, BusError, InterfaceMap, ManagedObjects, Method, ObjectEvent, Properties,
    PropertiesChanged, Value, BLUEZ,
};
use futures::stream::{self, LocalBoxStream, StreamExt};
use std::collections::HashMap;
use tracing::{debug, warn};
use zbus::fdo::{ObjectManagerProxy, PropertiesProxy};
use zbus::names::InterfaceName;
use zbus::zvariant::Value as ZValue;
use zbus::{Connection, Proxy};

/// Handle to the system bus connection. Cloning shares the connection.
#[derive(Clone)]
pub struct DbusBus {
    conn: Connection,
}

impl DbusBus {
    pub async fn system() -> Result<Self, BusError> {
        let conn = Connection::system()
            .await
            .map_err(|e| BusError::transport("system bus", "connect", e))?;
        Ok(Self { conn })
    }

    async fn object_manager(&self) -> Result<ObjectManagerProxy<'static>, BusError> {
        let err = |e: zbus::Error| BusError::transport("/", "ObjectManager", e);
        ObjectManagerProxy::builder(&self.conn)
            .destination(BLUEZ)
            .map_err(err)?
            .path("/")
            .map_err(err)?
            .build()
            .await
            .map_err(err)
    }

    async fn properties(&self, path: &str) -> Result<PropertiesProxy<'static>, BusError> {
        let err = |e: zbus::Error| BusError::transport(path, "Properties", e);
        PropertiesProxy::builder(&self.conn)
            .destination(BLUEZ)
            .map_err(err)?
            .path(path.to_owned())
            .map_err(err)?
            .build()
            .await
            .map_err(err)
    }
}

fn interface_name<'a>(path: &str, interface: &'a str) -> Result<InterfaceName<'a>, BusError> {
    InterfaceName::try_from(interface).map_err(|e| BusError::transport(path, interface, e))
}

fn convert(value: &ZValue<'_>) -> Value {
    match value {
        ZValue::Bool(b) => Value::Bool(*b),
        ZValue::I16(v) => Value::I16(*v),
        ZValue::U16(v) => Value::U16(*v),
        ZValue::Str(s) => Value::Str(s.to_string()),
        ZValue::ObjectPath(p) => Value::Path(p.to_string()),
        ZValue::Value(inner) => convert(inner),
        ZValue::Array(array) => match array.element_signature().as_str() {
            "y" => Value::Bytes(
                array
                    .iter()
                    .filter_map(|v| match v {
                        ZValue::U8(b) => Some(*b),
                        _ => None,
                    })
                    .collect(),
            ),
            "s" | "o" => Value::StrList(
                array
                    .iter()
                    .filter_map(|v| match v {
                        ZValue::Str(s) => Some(s.to_string()),
                        ZValue::ObjectPath(p) => Some(p.to_string()),
                        _ => None,
                    })
                    .collect(),
            ),
            other => Value::Other(format!("a{other}")),
        },
        other => Value::Other(other.value_signature().to_string()),
    }
}

fn to_zvalue(value: Value) -> Option<ZValue<'static>> {
    Some(match value {
        Value::Bool(b) => ZValue::from(b),
        Value::I16(v) => ZValue::from(v),
        Value::U16(v) => ZValue::from(v),
        Value::Str(s) => ZValue::from(s),
        Value::Bytes(b) => ZValue::from(b),
        Value::StrList(l) => ZValue::from(l),
        Value::Path(_) | Value::Unit | Value::Other(_) => return None,
    })
}

fn convert_properties<'a, K: AsRef<str>>(
    props: impl IntoIterator<Item = (K, &'a ZValue<'a>)>,
) -> Properties {
    props
        .into_iter()
        .map(|(k, v)| (k.as_ref().to_string(), convert(v)))
        .collect()
}

impl Bus for DbusBus {
    async fn managed_objects(&self) -> Result<ManagedObjects, BusError> {
        let objects = self
            .object_manager()
            .await?
            .get_managed_objects()
            .await
            .map_err(|e| BusError::transport("/", "GetManagedObjects", e))?;
        Ok(objects
            .iter()
            .map(|(path, interfaces)| {
                let interfaces: InterfaceMap = interfaces
                    .iter()
                    .map(|(name, props)| {
                        let props = props.iter().map(|(k, v)| (k.as_str(), &**v));
                        (name.to_string(), convert_properties(props))
                    })
                    .collect();
                (path.to_string(), interfaces)
            })
            .collect())
    }

    async fn get_property(
        &self,
        path: &str,
        interface: &str,
        name: &str,
    ) -> Result<Value, BusError> {
        let value = self
            .properties(path)
            .await?
            .get(interface_name(path, interface)?, name)
            .await
            .map_err(|e| BusError::transport(path, format!("Get {name}"), e))?;
        Ok(convert(&value))
    }

    async fn set_property(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        value: Value,
    ) -> Result<(), BusError> {
        let Some(value) = to_zvalue(value.clone()) else {
            return Err(BusError::UnexpectedType {
                path: path.to_string(),
                property: name.to_string(),
                value,
            });
        };
        self.properties(path)
            .await?
            .set(interface_name(path, interface)?, name, &value)
            .await
            .map_err(|e| BusError::transport(path, format!("Set {name}"), e))
    }

    async fn call(&self, path: &str, method: Method) -> Result<Value, BusError> {
        let member = method.member();
        let err = |e: zbus::Error| BusError::transport(path, member, e);
        let proxy = Proxy::new(&self.conn, BLUEZ, path.to_owned(), method.interface())
            .await
            .map_err(err)?;
        debug!("{} {}", member, path);

        let options: HashMap<&str, ZValue<'_>> = HashMap::new();
        match method {
            Method::SetDiscoveryFilter(filter) => {
                let uuids: Vec<String> = filter.uuids.iter().map(|u| u.to_string()).collect();
                let mut dict: HashMap<&str, ZValue<'_>> = HashMap::new();
                dict.insert("UUIDs", ZValue::from(uuids));
                dict.insert("Transport", ZValue::from(filter.transport));
                proxy.call::<_, _, ()>(member, &(dict,)).await.map_err(err)?;
                Ok(Value::Unit)
            }
            Method::ReadValue => {
                let bytes: Vec<u8> = proxy.call(member, &(options,)).await.map_err(err)?;
                Ok(Value::Bytes(bytes))
            }
            Method::WriteValue(bytes) => {
                proxy
                    .call::<_, _, ()>(member, &(bytes, options))
                    .await
                    .map_err(err)?;
                Ok(Value::Unit)
            }
            Method::StartDiscovery
            | Method::StopDiscovery
            | Method::Connect
            | Method::Disconnect
            | Method::StartNotify
            | Method::StopNotify => {
                proxy.call::<_, _, ()>(member, &()).await.map_err(err)?;
                Ok(Value::Unit)
            }
        }
    }

    async fn property_changes(
        &self,
        path: &str,
    ) -> Result<LocalBoxStream<'static, PropertiesChanged>, BusError> {
        let signals = self
            .properties(path)
            .await?
            .receive_properties_changed()
            .await
            .map_err(|e| BusError::transport(path, "PropertiesChanged", e))?;
        let path = path.to_owned();
        Ok(signals
            .filter_map(move |signal| {
                let parsed = match signal.args() {
                    Ok(args) => Some(PropertiesChanged {
                        interface: args.interface_name().to_string(),
                        changed: convert_properties(
                            args.changed_properties().iter().map(|(k, v)| (*k, v)),
                        ),
                        invalidated: args
                            .invalidated_properties()
                            .iter()
                            .map(|p| p.to_string())
                            .collect(),
                    }),
                    Err(e) => {
                        warn!("Malformed PropertiesChanged on {}: {}", path, e);
                        None
                    }
                };
                async move { parsed }
            })
            .boxed_local())
    }

    async fn object_events(&self) -> Result<LocalBoxStream<'static, ObjectEvent>, BusError> {
        let manager = self.object_manager().await?;
        let added = manager
            .receive_interfaces_added()
            .await
            .map_err(|e| BusError::transport("/", "InterfacesAdded", e))?
            .filter_map(|signal| {
                let event = signal.args().ok().map(|args| ObjectEvent::Added {
                    path: args.object_path().to_string(),
                    interfaces: args
                        .interfaces_and_properties()
                        .iter()
                        .map(|(name, props)| {
                            let props = props.iter().map(|(k, v)| (*k, v));
                            (name.to_string(), convert_properties(props))
                        })
                        .collect(),
                });
                async move { event }
            });
        let removed = manager
            .receive_interfaces_removed()
            .await
            .map_err(|e| BusError::transport("/", "InterfacesRemoved", e))?
            .filter_map(|signal| {
                let event = signal.args().ok().map(|args| ObjectEvent::Removed {
                    path: args.object_path().to_string(),
                    interfaces: args.interfaces().iter().map(|i| i.to_string()).collect(),
                });
                async move { event }
            });
        Ok(stream::select(added, removed).boxed_local())
    }
}
