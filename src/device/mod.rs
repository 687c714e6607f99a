//! # Device Module
//!
//! Virtualizes the remote nodes of the wireless sensor/actuator network. Every node
//! speaks the same small HTTP protocol (see [`protocol`]): a connection endpoint used
//! once for the handshake, and a data endpoint that is read (sensors) or written
//! (actuators).
//!
//! ```text
//! device/
//! ├── protocol.rs  - wire packets, endpoints and the shared HTTP client
//! ├── sensor.rs    - periodic reads with stale-value fallback
//! ├── actuator.rs  - write-with-retry actuation
//! └── registry.rs  - address → device map with observer fan-out
//! ```
//!
//! A device never surfaces transport failures to its caller: reads fall back to the
//! last good value and failed writes are retried in the background. The only
//! observable trace of a failure is the reachability flag, which always reflects the
//! most recent synchronization attempt.

pub mod actuator;
pub mod protocol;
pub mod registry;
pub mod sensor;

pub use actuator::Actuator;
pub use protocol::{ClientSettings, ConnectionPacket, DataPacket, DeviceClient};
pub use registry::{DeviceEvent, DeviceRegistry};
pub use sensor::Sensor;

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Errors produced by the device protocol client
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The node did not answer the handshake or answered with something that is not
    /// a connection packet
    #[error("could not establish a connection with the node: {0}")]
    Connection(String),

    /// The handshake declared a device type this gateway does not drive
    #[error("unsupported node type: {0}")]
    UnsupportedType(String),

    /// A PUT to an actuator's data endpoint failed
    #[error("actuation failed: {0}")]
    Actuation(String),

    /// The HTTP client itself could not be built
    #[error("http client error: {0}")]
    Client(String),
}

/// The device families understood by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Sensor,
    Actuator,
}

impl DeviceKind {
    /// Maps the `type` field of a connection packet
    pub fn from_wire(device_type: &str) -> Option<Self> {
        match device_type {
            "sensor" => Some(DeviceKind::Sensor),
            "actuator" => Some(DeviceKind::Actuator),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Sensor => write!(f, "sensor"),
            DeviceKind::Actuator => write!(f, "actuator"),
        }
    }
}

/// Attributes shared by every node
#[derive(Debug)]
pub struct Node {
    address: String,
    mac: String,
    service: String,
    reachable: AtomicBool,
}

impl Node {
    pub fn new(address: impl Into<String>, mac: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            mac: mac.into(),
            service: service.into(),
            reachable: true.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Outcome of the most recent synchronization attempt
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            ip: self.address.clone(),
            mac: self.mac.clone(),
            service: self.service.clone(),
        }
    }
}

/// Serializable snapshot of a [`Node`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub ip: String,
    pub mac: String,
    pub service: String,
}

/// A synchronized remote node
#[derive(Debug)]
pub enum Device {
    Sensor(Sensor),
    Actuator(Actuator),
}

impl Device {
    pub fn node(&self) -> &Node {
        match self {
            Device::Sensor(sensor) => sensor.node(),
            Device::Actuator(actuator) => actuator.node(),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            Device::Sensor(_) => DeviceKind::Sensor,
            Device::Actuator(_) => DeviceKind::Actuator,
        }
    }

    pub fn address(&self) -> &str {
        self.node().address()
    }

    pub fn is_reachable(&self) -> bool {
        self.node().is_reachable()
    }

    pub fn as_sensor(&self) -> Option<&Sensor> {
        match self {
            Device::Sensor(sensor) => Some(sensor),
            Device::Actuator(_) => None,
        }
    }

    pub fn as_actuator(&self) -> Option<&Actuator> {
        match self {
            Device::Actuator(actuator) => Some(actuator),
            Device::Sensor(_) => None,
        }
    }
}
