//! Remote Object Bridge
//!
//! Wraps one object path on the bus. Method calls go straight through the
//! [`Bus`]; property change signals are pumped by a single local task per
//! wrapper into a table of one-shot waiters keyed by property name.

use crate::infrastructure::bluez::bus::{Bus, BusError, Method, PropertiesChanged, Value};
use futures::StreamExt;
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::trace;

/// Pending waiters of one object, keyed by property name.
///
/// A dispatched signal resolves every waiter registered for a named property
/// and then forgets them; waiters registered later wait for the next signal.
#[derive(Default)]
pub struct PropertyWaiters {
    changed: HashMap<String, Vec<oneshot::Sender<Value>>>,
    invalidated: HashMap<String, Vec<oneshot::Sender<()>>>,
    listeners: Vec<mpsc::UnboundedSender<PropertiesChanged>>,
}

impl PropertyWaiters {
    pub fn on_changed(&mut self, property: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.changed.entry(property.to_string()).or_default().push(tx);
        rx
    }

    pub fn on_invalidated(&mut self, property: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.invalidated
            .entry(property.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub fn listen(&mut self) -> mpsc::UnboundedReceiver<PropertiesChanged> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(tx);
        rx
    }

    pub fn dispatch(&mut self, signal: &PropertiesChanged) {
        for (name, value) in &signal.changed {
            if let Some(waiters) = self.changed.remove(name) {
                for w in waiters {
                    let _ = w.send(value.clone());
                }
            }
        }
        for name in &signal.invalidated {
            if let Some(waiters) = self.invalidated.remove(name) {
                for w in waiters {
                    let _ = w.send(());
                }
            }
        }
        self.listeners.retain(|l| l.send(signal.clone()).is_ok());
    }

    /// Number of waiters still pending on `property`
    pub fn pending(&self, property: &str) -> usize {
        self.changed.get(property).map_or(0, Vec::len)
            + self.invalidated.get(property).map_or(0, Vec::len)
    }

    /// Drops every waiter; their futures fail with [`BusError::ObjectGone`]
    pub fn close(&mut self) {
        self.changed.clear();
        self.invalidated.clear();
        self.listeners.clear();
    }
}

/// Next change of one property on one object
pub struct PropertyChange {
    path: Rc<str>,
    rx: oneshot::Receiver<Value>,
}

impl Future for PropertyChange {
    type Output = Result<Value, BusError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| BusError::ObjectGone(self.path.to_string())))
    }
}

/// Next invalidation of one property on one object
pub struct PropertyInvalidation {
    path: Rc<str>,
    rx: oneshot::Receiver<()>,
}

impl Future for PropertyInvalidation {
    type Output = Result<(), BusError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| BusError::ObjectGone(self.path.to_string())))
    }
}

struct Inner<B> {
    bus: Rc<B>,
    path: Rc<str>,
    waiters: Rc<RefCell<PropertyWaiters>>,
    pump: JoinHandle<()>,
}

impl<B> Drop for Inner<B> {
    fn drop(&mut self) {
        self.pump.abort();
        self.waiters.borrow_mut().close();
    }
}

/// Shared handle to one remote object. Must be created inside a `LocalSet`.
pub struct RemoteObject<B> {
    inner: Rc<Inner<B>>,
}

impl<B> Clone for RemoteObject<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<B: Bus + 'static> RemoteObject<B> {
    /// Subscribes to the object's property signals and starts its pump task
    pub async fn attach(bus: Rc<B>, path: &str) -> Result<Self, BusError> {
        let mut signals = bus.property_changes(path).await?;
        let waiters = Rc::new(RefCell::new(PropertyWaiters::default()));
        let path: Rc<str> = Rc::from(path);

        let pump = {
            let waiters = Rc::clone(&waiters);
            let path = Rc::clone(&path);
            tokio::task::spawn_local(async move {
                while let Some(signal) = signals.next().await {
                    trace!("PropertiesChanged {} {:?}", path, signal);
                    waiters.borrow_mut().dispatch(&signal);
                }
                trace!("Signal stream for {} closed", path);
                waiters.borrow_mut().close();
            })
        };

        Ok(Self {
            inner: Rc::new(Inner {
                bus,
                path,
                waiters,
                pump,
            }),
        })
    }

    pub fn bus(&self) -> &Rc<B> {
        &self.inner.bus
    }

    pub async fn get(&self, interface: &str, name: &str) -> Result<Value, BusError> {
        self.inner.bus.get_property(self.path(), interface, name).await
    }

    pub async fn set(&self, interface: &str, name: &str, value: Value) -> Result<(), BusError> {
        self.inner
            .bus
            .set_property(self.path(), interface, name, value)
            .await
    }

    pub async fn get_bool(&self, interface: &str, name: &str) -> Result<bool, BusError> {
        let value = self.get(interface, name).await?;
        value.as_bool().ok_or_else(|| self.unexpected(name, value))
    }

    pub async fn get_string(&self, interface: &str, name: &str) -> Result<String, BusError> {
        let value = self.get(interface, name).await?;
        match value.as_str() {
            Some(s) => Ok(s.to_string()),
            None => Err(self.unexpected(name, value)),
        }
    }

    pub async fn call(&self, method: Method) -> Result<Value, BusError> {
        self.inner.bus.call(self.path(), method).await
    }

    pub(crate) fn unexpected(&self, property: &str, value: Value) -> BusError {
        BusError::UnexpectedType {
            path: self.path().to_string(),
            property: property.to_string(),
            value,
        }
    }
}

impl<B> RemoteObject<B> {
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Resolves with the value carried by the next change of `property`
    pub fn changed(&self, property: &str) -> PropertyChange {
        PropertyChange {
            path: Rc::clone(&self.inner.path),
            rx: self.inner.waiters.borrow_mut().on_changed(property),
        }
    }

    /// Resolves on the next invalidation of `property`
    pub fn invalidated(&self, property: &str) -> PropertyInvalidation {
        PropertyInvalidation {
            path: Rc::clone(&self.inner.path),
            rx: self.inner.waiters.borrow_mut().on_invalidated(property),
        }
    }

    /// Every signal received from now on, until the object is dropped
    pub fn watch(&self) -> mpsc::UnboundedReceiver<PropertiesChanged> {
        self.inner.waiters.borrow_mut().listen()
    }

    pub fn pending(&self, property: &str) -> usize {
        self.inner.waiters.borrow().pending(property)
    }
}
