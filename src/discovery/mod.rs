//! # Discovery Module
//!
//! Finds nodes on the local network and synchronizes them into the
//! [`DeviceRegistry`](crate::device::DeviceRegistry).
//!
//! ```text
//! SSDP multicast ──► ssdp reader ──[Announcement]──► Synchronizer ──► DeviceClient::connect
//!                                                         │ok                 │err
//!                                                  registry.add        not_synced list
//! ```
//!
//! The monitor is a two-state machine (`Idle` → `Listening` → `Idle`). A failed
//! handshake is only recorded for diagnostics; the node gets another chance the next
//! time it announces itself.

pub mod ssdp;

pub use ssdp::Announcement;

use crate::device::{DeviceClient, DeviceRegistry};
use statum::{machine, state, transition};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors raised while opening the announcement socket
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("could not bind the SSDP socket: {0}")]
    Bind(std::io::Error),

    #[error("could not join the SSDP multicast group: {0}")]
    Join(std::io::Error),
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// Substring of the `SERVER` banner that marks a node of ours
    pub device_family: String,
    /// Buffered announcements between socket reader and synchronizer
    pub queue_capacity: usize,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            device_family: "Arduino".to_string(),
            queue_capacity: 64,
        }
    }
}

/// What became of a single announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Not one of our nodes, or already registered
    Ignored,
    Synced,
    NotSynced,
}

/// Turns announcements into registered devices
#[derive(Debug)]
pub struct Synchronizer {
    registry: Arc<DeviceRegistry>,
    client: DeviceClient,
    device_family: String,
    not_synced: Mutex<Vec<String>>,
}

impl Synchronizer {
    pub fn new(registry: Arc<DeviceRegistry>, client: DeviceClient, device_family: &str) -> Self {
        Self {
            registry,
            client,
            device_family: device_family.to_string(),
            not_synced: Mutex::new(Vec::new()),
        }
    }

    pub async fn handle(&self, announcement: &Announcement) -> SyncOutcome {
        debug!(
            "Alive: from={} server={} usn={} location={}",
            announcement.address, announcement.server, announcement.usn, announcement.location
        );

        if !announcement.server.contains(&self.device_family) {
            return SyncOutcome::Ignored;
        }
        let address = &announcement.address;
        if self.registry.contains(address).await {
            return SyncOutcome::Ignored;
        }

        match self.client.connect(address).await {
            Ok(device) => {
                self.registry.add(address.clone(), device).await;
                self.not_synced.lock().await.retain(|a| a != address);
                SyncOutcome::Synced
            }
            Err(e) => {
                warn!("Could not synchronize {}: {}", address, e);
                let mut not_synced = self.not_synced.lock().await;
                if !not_synced.contains(address) {
                    not_synced.push(address.clone());
                }
                SyncOutcome::NotSynced
            }
        }
    }

    /// Addresses whose last handshake attempt failed
    pub async fn not_synced(&self) -> Vec<String> {
        self.not_synced.lock().await.clone()
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum MonitorState {
    Idle,
    Listening,
}

#[machine]
#[derive(Debug)]
pub struct DiscoveryMonitor<MonitorState> {
    synchronizer: Arc<Synchronizer>,
    settings: DiscoverySettings,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: MonitorStateTrait> DiscoveryMonitor<S> {
    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.synchronizer
    }

    pub async fn not_synced(&self) -> Vec<String> {
        self.synchronizer.not_synced().await
    }
}

impl DiscoveryMonitor<Idle> {
    pub fn create(
        registry: Arc<DeviceRegistry>,
        client: DeviceClient,
        settings: Option<DiscoverySettings>,
    ) -> Self {
        let settings = settings.unwrap_or_default();
        let synchronizer = Arc::new(Synchronizer::new(
            registry,
            client,
            &settings.device_family,
        ));
        Self::builder()
            .synchronizer(synchronizer)
            .settings(settings)
            .cancel(CancellationToken::new())
            .tasks(Vec::new())
            .build()
    }

    /// Joins the SSDP group and starts synchronizing announced nodes
    pub fn start(self) -> Result<DiscoveryMonitor<Listening>, DiscoveryError> {
        let socket = ssdp::bind_multicast()?;
        info!(
            "Listening for SSDP announcements on {}:{}",
            ssdp::SSDP_MULTICAST_ADDR,
            ssdp::SSDP_PORT
        );

        let (tx, rx) = mpsc::channel(self.settings.queue_capacity);
        let reader = ssdp::spawn_reader(socket, tx, self.cancel.clone());
        let mut monitor = self.listen(rx);
        monitor.tasks.push(reader);
        Ok(monitor)
    }
}

#[transition]
impl DiscoveryMonitor<Idle> {
    /// Synchronizes announcements from an arbitrary source
    pub fn listen(
        mut self,
        mut announcements: mpsc::Receiver<Announcement>,
    ) -> DiscoveryMonitor<Listening> {
        let synchronizer = self.synchronizer.clone();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                let announcement = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = announcements.recv() => match next {
                        Some(announcement) => announcement,
                        None => break,
                    },
                };
                synchronizer.handle(&announcement).await;
            }
            debug!("Discovery listener stopped");
        });
        self.tasks.push(task);
        self.transition()
    }
}

#[transition]
impl DiscoveryMonitor<Listening> {
    /// Releases the socket and returns to `Idle`
    pub async fn stop(mut self) -> DiscoveryMonitor<Idle> {
        info!("Stopping discovery");
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Discovery task ended abnormally: {}", e);
            }
        }
        self.cancel = CancellationToken::new();
        self.transition()
    }
}
