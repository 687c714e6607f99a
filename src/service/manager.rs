//! Periodic reconciliation of plugin artifacts and loaded services
//!
//! ```text
//!              every scan_interval
//! scan(dir) ───────────────────────► current
//! to_add    = current − known   ──► load, init, attach, listen
//! to_remove = known − current   ──► detach, close, stop
//! known     = current (minus failed loads, retried next pass)
//! ```

use super::loader::{ServiceLoader, PLUGIN_EXTENSION};
use super::{ConcurrentSet, ServiceError, ServiceHandle, ServiceInfo, ServiceMap};
use crate::mqtt::TopicDataTable;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Pause between reconciliation passes
    pub scan_interval: Duration,
    /// Updates buffered per service before notification rounds block
    pub mailbox_capacity: usize,
    /// Artifact file extension, without the dot
    pub extension: String,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(1),
            mailbox_capacity: 16,
            extension: PLUGIN_EXTENSION.to_string(),
        }
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.failed.is_empty()
    }
}

pub struct ServiceManager {
    dir: PathBuf,
    loader: Arc<dyn ServiceLoader>,
    table: Arc<TopicDataTable>,
    services: Arc<ServiceMap>,
    known: ConcurrentSet<PathBuf>,
    settings: ManagerSettings,
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager")
            .field("dir", &self.dir)
            .field("known", &self.known)
            .field("settings", &self.settings)
            .finish()
    }
}

impl ServiceManager {
    pub fn new(
        dir: impl Into<PathBuf>,
        loader: Arc<dyn ServiceLoader>,
        table: Arc<TopicDataTable>,
        services: Arc<ServiceMap>,
        settings: Option<ManagerSettings>,
    ) -> Self {
        Self {
            dir: dir.into(),
            loader,
            table,
            services,
            known: ConcurrentSet::new(),
            settings: settings.unwrap_or_default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn list(&self) -> Vec<ServiceInfo> {
        self.services.list().await
    }

    /// Runs one scan and applies the difference to the loaded services
    pub async fn reconcile(&self) -> ReconcileReport {
        let current = scan(&self.dir, &self.settings.extension).await;
        let to_add = current.difference(&self.known);
        let to_remove = self.known.difference(&current);
        let mut report = ReconcileReport::default();

        for path in to_add.iter() {
            match self.start_service(&path).await {
                Ok(()) => {
                    self.known.add(path.clone());
                    report.added.push(path);
                }
                Err(e) => {
                    error!("Could not start service {}: {}", path.display(), e);
                    report.failed.push(path);
                }
            }
        }

        for path in to_remove.iter() {
            if let Some(handle) = self.services.remove(&path).await {
                handle.stop(&self.table).await;
                report.removed.push(path.clone());
            }
            self.known.remove(&path);
        }

        if !report.is_empty() {
            debug!(
                "Reconciled {}: +{} -{} !{}",
                self.dir.display(),
                report.added.len(),
                report.removed.len(),
                report.failed.len()
            );
        }
        report
    }

    async fn start_service(&self, path: &Path) -> Result<(), ServiceError> {
        let loader = self.loader.clone();
        let artifact = path.to_path_buf();
        let service = tokio::task::spawn_blocking(move || loader.load(&artifact))
            .await
            .map_err(|e| ServiceError::PluginLoad {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })??;

        let mut handle = ServiceHandle::new(path, service, self.settings.mailbox_capacity);
        info!(
            "Found service {} v{} at {}",
            handle.info().service_name,
            handle.info().version,
            path.display()
        );
        handle.init().await?;
        handle.subscribe(&self.table).await;
        handle.listen_for_updates();

        if let Some(previous) = self.services.add(handle).await {
            previous.stop(&self.table).await;
        }
        Ok(())
    }

    /// Stops every loaded service and forgets every artifact
    pub async fn stop_all(&self) {
        for handle in self.services.drain().await {
            self.known.remove(&handle.path().to_path_buf());
            handle.stop(&self.table).await;
        }
    }

    /// Reconciles every `scan_interval` until `shutdown` fires, then stops every service
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        info!(
            "Starting the service manager, serving services from {}",
            self.dir.display()
        );
        let mut ticker = tokio::time::interval(self.settings.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.reconcile().await;
                }
            }
        }

        info!("Service manager stopping, unloading {} services", self.services.len().await);
        self.stop_all().await;
    }

    pub fn spawn(self) -> ServiceManagerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task_handle = tokio::spawn(self.run(shutdown_rx));
        ServiceManagerHandle {
            shutdown_tx: Some(shutdown_tx),
            task_handle: Some(task_handle),
        }
    }
}

/// Background reconciliation loop
#[derive(Debug)]
pub struct ServiceManagerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<JoinHandle<()>>,
}

impl ServiceManagerHandle {
    /// Stops the loop and every loaded service, waiting for both
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(()).is_err() {
                warn!("Service manager already terminated");
            }
        }
        if let Some(task) = self.task_handle.take() {
            if let Err(e) = task.await {
                error!("Service manager ended abnormally: {}", e);
            }
        }
    }
}

/// Canonical paths of every artifact below `dir` with the given extension
///
/// A missing or unreadable directory yields an empty set.
pub async fn scan(dir: &Path, extension: &str) -> ConcurrentSet<PathBuf> {
    let dir = dir.to_path_buf();
    let extension = extension.to_string();
    let walked = tokio::task::spawn_blocking(move || {
        WalkDir::new(&dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .is_some_and(|ext| ext == extension.as_str())
            })
            .filter_map(|entry| entry.path().canonicalize().ok())
            .collect::<ConcurrentSet<PathBuf>>()
    })
    .await;

    walked.unwrap_or_else(|e| {
        warn!("Artifact scan aborted: {}", e);
        ConcurrentSet::new()
    })
}
