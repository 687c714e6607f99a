//! Actuator client with background re-sync
//!
//! ```text
//! actuate(x) ──► supersede retry loop ──► x == state? ──yes──► done (re-arm if unsynced)
//!                                              │no
//!                                              ▼
//!                                   state = x, PUT /api/data
//!                                      │ok            │err
//!                                   synced      unsynced + retry loop (every retry_interval)
//! ```
//!
//! Every write to the node, whether from `actuate` or from a retry, happens under one
//! per-actuator lock. A new command therefore waits for an in-flight retry to land
//! before sending its own state, and a superseded retry never writes again.
//! The commanded state and the sync flag are mirrored in atomics so readers never
//! wait on the network.

use super::protocol::{DataPacket, DeviceClient};
use super::{DeviceError, Node};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A node driven by commanded numeric states
#[derive(Debug, Clone)]
pub struct Actuator {
    shared: Arc<ActuatorShared>,
}

#[derive(Debug)]
struct ActuatorShared {
    node: Node,
    client: DeviceClient,
    /// `f64` bits of the last commanded state, written under `state`
    commanded: AtomicU64,
    synced: AtomicBool,
    state: Mutex<ActuatorState>,
}

#[derive(Debug)]
struct ActuatorState {
    /// Bumped whenever a retry loop is superseded; a loop only writes while it still
    /// owns the current generation.
    generation: u64,
    retry: Option<RetryHandle>,
}

#[derive(Debug)]
struct RetryHandle {
    stop_tx: oneshot::Sender<()>,
    _task: JoinHandle<()>,
}

impl ActuatorState {
    /// Signals the running retry loop, if any, to exit
    ///
    /// The oneshot send never blocks, whether or not a loop is still listening.
    fn supersede_retry(&mut self) {
        self.generation += 1;
        if let Some(retry) = self.retry.take() {
            if retry.stop_tx.send(()).is_err() {
                debug!("Retry loop already finished");
            }
        }
    }
}

impl ActuatorShared {
    fn commanded(&self) -> f64 {
        f64::from_bits(self.commanded.load(Ordering::Acquire))
    }

    async fn put_state(&self, state: f64) -> Result<(), DeviceError> {
        let outcome = self
            .client
            .put_data(self.node.address(), DataPacket { payload: state })
            .await;
        self.node.set_reachable(outcome.is_ok());
        outcome
            .map(|echo| debug!("Actuator {} acknowledged {}", self.node.address(), echo.payload))
            .map_err(|e| DeviceError::Actuation(e.to_string()))
    }
}

impl Actuator {
    pub(crate) fn new(node: Node, client: DeviceClient) -> Self {
        Self {
            shared: Arc::new(ActuatorShared {
                node,
                client,
                commanded: AtomicU64::new(0.0_f64.to_bits()),
                synced: AtomicBool::new(true),
                state: Mutex::new(ActuatorState {
                    generation: 0,
                    retry: None,
                }),
            }),
        }
    }

    pub fn node(&self) -> &Node {
        &self.shared.node
    }

    /// Last commanded state, acknowledged or not
    pub async fn state(&self) -> f64 {
        self.shared.commanded()
    }

    /// Whether the node acknowledged the current state
    pub async fn is_synced(&self) -> bool {
        self.shared.synced.load(Ordering::Acquire)
    }

    /// Commands `target` on the remote node
    ///
    /// Idempotent for an already commanded state. A failed write is logged and
    /// retried in the background until it succeeds or another command supersedes it.
    pub async fn actuate(&self, target: f64) {
        let mut guard = self.shared.state.lock().await;
        guard.supersede_retry();

        if self.shared.commanded() == target {
            if !self.shared.synced.load(Ordering::Acquire) {
                debug!(
                    "Actuator {} still unsynced on {}, re-arming retry",
                    self.node().address(),
                    target
                );
                self.spawn_retry(&mut guard, target);
            }
            return;
        }

        self.shared
            .commanded
            .store(target.to_bits(), Ordering::Release);
        match self.shared.put_state(target).await {
            Ok(()) => {
                self.shared.synced.store(true, Ordering::Release);
                info!("Actuator {} set to {}", self.node().address(), target);
            }
            Err(e) => {
                warn!(
                    "Actuator {} did not accept {}, retrying every {:?}: {}",
                    self.node().address(),
                    target,
                    self.shared.client.settings().retry_interval,
                    e
                );
                self.shared.synced.store(false, Ordering::Release);
                self.spawn_retry(&mut guard, target);
            }
        }
    }

    fn spawn_retry(&self, guard: &mut ActuatorState, target: f64) {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(retry_loop(
            self.shared.clone(),
            target,
            guard.generation,
            stop_rx,
        ));
        guard.retry = Some(RetryHandle {
            stop_tx,
            _task: task,
        });
    }
}

async fn retry_loop(
    shared: Arc<ActuatorShared>,
    target: f64,
    generation: u64,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let interval = shared.client.settings().retry_interval;
    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => {
                debug!("Retry loop for {} stopped", shared.node.address());
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let mut guard = shared.state.lock().await;
        if guard.generation != generation {
            debug!("Retry loop for {} superseded", shared.node.address());
            return;
        }

        match shared.put_state(target).await {
            Ok(()) => {
                shared.synced.store(true, Ordering::Release);
                guard.retry = None;
                info!("Actuator {} re-synced on {}", shared.node.address(), target);
                return;
            }
            Err(e) => warn!("Re-sync of {} failed: {}", shared.node.address(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::device::protocol::{ClientSettings, DeviceClient};
    use crate::device::test_support::{serve, MockNode};
    use crate::device::Device;
    use std::time::Duration;

    fn fast_client() -> DeviceClient {
        DeviceClient::new(ClientSettings {
            retry_interval: Duration::from_millis(50),
            ..ClientSettings::default()
        })
        .unwrap()
    }

    async fn connect(node: &std::sync::Arc<MockNode>) -> Device {
        let address = serve(node.clone()).await;
        fast_client().connect(&address).await.unwrap()
    }

    #[tokio::test]
    async fn test_actuate_sets_state() {
        let node = MockNode::new("actuator");
        let device = connect(&node).await;
        let actuator = device.as_actuator().unwrap();

        actuator.actuate(1500.0).await;

        assert_eq!(actuator.state().await, 1500.0);
        assert!(actuator.is_synced().await);
        assert_eq!(node.written(), vec![1500.0]);
    }

    #[tokio::test]
    async fn test_actuate_is_idempotent() {
        let node = MockNode::new("actuator");
        let device = connect(&node).await;
        let actuator = device.as_actuator().unwrap();

        actuator.actuate(42.0).await;
        actuator.actuate(42.0).await;

        assert_eq!(node.writes(), 1);
    }

    #[tokio::test]
    async fn test_actuate_initial_state_is_noop() {
        let node = MockNode::new("actuator");
        let device = connect(&node).await;

        device.as_actuator().unwrap().actuate(0.0).await;
        assert_eq!(node.writes(), 0);
    }

    #[tokio::test]
    async fn test_failed_write_is_retried_until_synced() {
        let node = MockNode::new("actuator");
        let device = connect(&node).await;
        let actuator = device.as_actuator().unwrap();

        node.set_online(false);
        actuator.actuate(7.0).await;
        assert_eq!(actuator.state().await, 7.0);
        assert!(!actuator.is_synced().await);
        assert!(!device.is_reachable());

        node.set_online(true);
        let mut synced = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            if actuator.is_synced().await {
                synced = true;
                break;
            }
        }
        assert!(synced);
        assert!(device.is_reachable());
        assert_eq!(node.written(), vec![7.0]);
    }

    #[tokio::test]
    async fn test_new_command_supersedes_retry() {
        let node = MockNode::new("actuator");
        let device = connect(&node).await;
        let actuator = device.as_actuator().unwrap();

        node.set_online(false);
        actuator.actuate(1.0).await;
        assert!(!actuator.is_synced().await);

        node.set_online(true);
        actuator.actuate(2.0).await;
        assert!(actuator.is_synced().await);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(node.written(), vec![2.0]);
        assert_eq!(actuator.state().await, 2.0);
    }

    #[tokio::test]
    async fn test_new_command_waits_for_in_flight_retry() {
        let node = MockNode::new("actuator");
        let device = connect(&node).await;
        let actuator = device.as_actuator().unwrap();

        node.set_online(false);
        actuator.actuate(1.0).await;

        // the retry fires at ~50ms and takes 250ms to land
        node.set_online(true);
        node.set_write_delay(Some(Duration::from_millis(250)));
        tokio::time::sleep(Duration::from_millis(120)).await;
        node.set_write_delay(None);

        actuator.actuate(2.0).await;

        assert_eq!(actuator.state().await, 2.0);
        assert!(actuator.is_synced().await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(node.written(), vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_state_readable_during_write() {
        let node = MockNode::new("actuator");
        let device = connect(&node).await;
        let actuator = device.as_actuator().unwrap().clone();

        node.set_write_delay(Some(Duration::from_millis(300)));
        let writer = actuator.clone();
        let pending = tokio::spawn(async move { writer.actuate(5.0).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let read = tokio::time::timeout(Duration::from_millis(50), actuator.state()).await;
        assert_eq!(read.unwrap(), 5.0);

        pending.await.unwrap();
        assert!(actuator.is_synced().await);
    }
}
