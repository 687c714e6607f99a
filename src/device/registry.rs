//! Address-keyed device registry
//!
//! ```text
//! DiscoveryMonitor ──add──► DeviceRegistry ──DeviceEvent──► observer mailboxes
//!        API ◄──get/connected_addresses──┘
//! ```
//!
//! Mutations fan out to every attached observer with a blocking send while the
//! registry lock is held. A slow observer therefore stalls the mutating caller until
//! it drains its mailbox; only internal, cooperating observers should attach.

use super::Device;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Structural change of the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Added(String),
    Removed(String),
}

impl DeviceEvent {
    pub fn address(&self) -> &str {
        match self {
            DeviceEvent::Added(address) | DeviceEvent::Removed(address) => address,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    devices: HashMap<String, Arc<Device>>,
    // Rebuilt lazily on the next listing after a structural change.
    addresses: Vec<String>,
    stale: bool,
    observers: Vec<mpsc::Sender<DeviceEvent>>,
}

impl RegistryInner {
    async fn notify(&mut self, event: DeviceEvent) {
        let mut alive = Vec::with_capacity(self.observers.len());
        for observer in self.observers.drain(..) {
            match observer.send(event.clone()).await {
                Ok(()) => alive.push(observer),
                Err(_) => debug!("Dropping registry observer whose receiver is gone"),
            }
        }
        self.observers = alive;
    }
}

/// Registry of every synchronized device, keyed by network address
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    inner: Mutex<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `device` under `address` unless the address is already taken
    ///
    /// Returns `true` if the device was inserted. An existing device is never
    /// replaced.
    pub async fn add(&self, address: impl Into<String>, device: Device) -> bool {
        let address = address.into();
        let mut inner = self.inner.lock().await;
        if inner.devices.contains_key(&address) {
            debug!("Device {} already registered, keeping the existing one", address);
            return false;
        }

        info!("Registering {} {}", device.kind(), address);
        inner.devices.insert(address.clone(), Arc::new(device));
        inner.stale = true;
        inner.notify(DeviceEvent::Added(address)).await;
        true
    }

    /// Removes the device at `address`, returning it if it was present
    pub async fn remove(&self, address: &str) -> Option<Arc<Device>> {
        let mut inner = self.inner.lock().await;
        let device = inner.devices.remove(address)?;

        info!("Removing device {}", address);
        inner.stale = true;
        inner.notify(DeviceEvent::Removed(address.to_string())).await;
        Some(device)
    }

    pub async fn get(&self, address: &str) -> Option<Arc<Device>> {
        self.inner.lock().await.devices.get(address).cloned()
    }

    pub async fn contains(&self, address: &str) -> bool {
        self.inner.lock().await.devices.contains_key(address)
    }

    /// Addresses of every registered device, in no particular order
    pub async fn connected_addresses(&self) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        if inner.stale {
            let rebuilt: Vec<String> = inner.devices.keys().cloned().collect();
            inner.addresses = rebuilt;
            inner.stale = false;
        }
        inner.addresses.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.devices.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Registers an observer for every future add and remove
    ///
    /// There is no explicit detach: dropping the receiving half unregisters the
    /// observer at the next mutation.
    pub async fn attach(&self, observer: mpsc::Sender<DeviceEvent>) {
        let mut inner = self.inner.lock().await;
        if inner.observers.iter().any(|o| o.same_channel(&observer)) {
            warn!("Registry observer attached twice, ignoring");
            return;
        }
        inner.observers.push(observer);
    }

    pub async fn observer_count(&self) -> usize {
        self.inner.lock().await.observers.len()
    }
}
