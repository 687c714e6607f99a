//! Wire protocol spoken by the nodes
//!
//! ```text
//! GET /api/conn  → { "type": "sensor"|"actuator", "mac": "..", "service": ".." }
//! GET /api/data  → { "payload": <f64> }                 (sensor)
//! PUT /api/data  ← { "payload": <f64> } → echo          (actuator)
//! ```

use super::{Actuator, Device, DeviceError, DeviceKind, Node, Sensor};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CONNECTION_ENDPOINT: &str = "/api/conn";
pub const DATA_ENDPOINT: &str = "/api/data";

/// Handshake answer of the connection endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionPacket {
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default, alias = "Service")]
    pub service: String,
}

/// Body of every data endpoint exchange
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPacket {
    pub payload: f64,
}

/// Timeouts and retry cadence of the device client
///
/// Every request is bounded; a node that stops answering costs its caller at most
/// the matching timeout.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Bound on the handshake request
    pub connection_timeout: Duration,
    /// Bound on a sensor read
    pub read_timeout: Duration,
    /// Bound on an actuator write
    pub write_timeout: Duration,
    /// Pause between background re-sync attempts of an unsynced actuator
    pub retry_interval: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(10),
        }
    }
}

/// HTTP client shared by every device
///
/// Cheap to clone; all clones share one connection stack.
#[derive(Debug, Clone)]
pub struct DeviceClient {
    http: reqwest::Client,
    settings: ClientSettings,
}

impl DeviceClient {
    pub fn new(settings: ClientSettings) -> Result<Self, DeviceError> {
        // Nodes are small boards that drop idle sockets, so connections are not pooled.
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| DeviceError::Client(e.to_string()))?;
        Ok(Self { http, settings })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    fn url(address: &str, endpoint: &str) -> String {
        format!("http://{}{}", address, endpoint)
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        address: &str,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<T, reqwest::Error> {
        self.http
            .get(Self::url(address, endpoint))
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<T>()
            .await
    }

    pub(crate) async fn put_data(
        &self,
        address: &str,
        packet: DataPacket,
    ) -> Result<DataPacket, reqwest::Error> {
        self.http
            .put(Self::url(address, DATA_ENDPOINT))
            .timeout(self.settings.write_timeout)
            .json(&packet)
            .send()
            .await?
            .error_for_status()?
            .json::<DataPacket>()
            .await
    }

    /// Performs the handshake with the node at `address` (`host[:port]`)
    ///
    /// One bounded round trip to the connection endpoint. On success the returned
    /// device is reachable and holds a zero reading/state.
    ///
    /// # Errors
    ///
    /// * [`DeviceError::Connection`] - node unreachable or answer not a connection packet
    /// * [`DeviceError::UnsupportedType`] - `type` is neither `sensor` nor `actuator`
    pub async fn connect(&self, address: &str) -> Result<Device, DeviceError> {
        debug!("Handshaking with node {}", address);
        let packet: ConnectionPacket = self
            .get_json(address, CONNECTION_ENDPOINT, self.settings.connection_timeout)
            .await
            .map_err(|e| {
                warn!("Handshake with {} failed: {}", address, e);
                DeviceError::Connection(e.to_string())
            })?;

        let kind = DeviceKind::from_wire(&packet.device_type)
            .ok_or_else(|| DeviceError::UnsupportedType(packet.device_type.clone()))?;

        let node = Node::new(address, packet.mac, packet.service);
        info!(
            "Connected to {} {} (mac {}, service {})",
            kind,
            address,
            node.mac(),
            node.service()
        );

        Ok(match kind {
            DeviceKind::Sensor => Device::Sensor(Sensor::new(node, self.clone())),
            DeviceKind::Actuator => Device::Actuator(Actuator::new(node, self.clone())),
        })
    }
}
