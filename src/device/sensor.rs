use super::protocol::{DataPacket, DeviceClient, DATA_ENDPOINT};
use super::Node;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A node that can be queried for sensed data
#[derive(Debug)]
pub struct Sensor {
    node: Node,
    client: DeviceClient,
    // Held for the whole read so at most one sync is in flight per sensor.
    last_reading: Mutex<f64>,
}

impl Sensor {
    pub(crate) fn new(node: Node, client: DeviceClient) -> Self {
        Self {
            node,
            client,
            last_reading: Mutex::new(0.0),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Fetches a fresh reading, falling back to the last good one
    ///
    /// Never fails: on timeout, refused connection or a malformed answer the previous
    /// reading is returned unchanged and the node is flagged unreachable.
    pub async fn read(&self) -> f64 {
        let mut last_reading = self.last_reading.lock().await;

        match self
            .client
            .get_json::<DataPacket>(
                self.node.address(),
                DATA_ENDPOINT,
                self.client.settings().read_timeout,
            )
            .await
        {
            Ok(packet) => {
                debug!("Sensor {} read {}", self.node.address(), packet.payload);
                *last_reading = packet.payload;
                self.node.set_reachable(true);
            }
            Err(e) => {
                warn!(
                    "Sensor {} unreachable, keeping last reading {}: {}",
                    self.node.address(),
                    *last_reading,
                    e
                );
                self.node.set_reachable(false);
            }
        }

        *last_reading
    }

    /// Last successful reading without contacting the node
    pub async fn last_reading(&self) -> f64 {
        *self.last_reading.lock().await
    }
}
