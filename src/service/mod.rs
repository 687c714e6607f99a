//! # Service Module
//!
//! Hosts the plugin services of the gateway. A service is a small unit of logic that
//! declares the topics it cares about and gets every update of those topics handed
//! to its `actuate` callback, in order, on its own task.
//!
//! ```text
//! service/
//! ├── concurrent_set.rs  - thread-safe set used for reconciliation diffs
//! ├── service_map.rs     - artifact path → loaded service
//! ├── loader.rs          - artifact → MoodyService (shared objects or built-ins)
//! ├── plugin.rs          - per-service mailbox, update loop and teardown
//! └── manager.rs         - periodic directory scan and hot load/unload
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//! artifact appears ─► load ─► init ─► attach to topics ─► update loop
//! artifact removed ─► detach from topics ─► close mailbox ─► stop
//! ```
//!
//! The artifact path is the identity of a service, whatever loader produced it.

pub mod concurrent_set;
pub mod loader;
pub mod manager;
pub mod plugin;
pub mod service_map;

pub use concurrent_set::ConcurrentSet;
pub use loader::{DylibLoader, ServiceLoader, StaticLoader, PLUGIN_EXTENSION};
pub use manager::{ManagerSettings, ReconcileReport, ServiceManager, ServiceManagerHandle};
pub use plugin::ServiceHandle;
pub use service_map::ServiceMap;

use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("could not load {path}: {reason}")]
    PluginLoad { path: PathBuf, reason: String },

    #[error("{path} does not export {export}")]
    MissingExport { path: PathBuf, export: &'static str },

    #[error("{path} exports an invalid {export}")]
    InvalidExport { path: PathBuf, export: &'static str },

    #[error("service {name} failed to initialize: {reason}")]
    Init { name: String, reason: String },

    #[error("actuation failed: {0}")]
    Actuate(String),
}

/// Capabilities every hosted service provides
///
/// Callbacks are synchronous and may block; the host runs them off the async
/// workers.
pub trait MoodyService: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Topic suffixes below the device namespace, e.g. `lamp/state`
    fn topics(&self) -> Vec<String>;

    /// Called once, before the service is attached to any topic
    fn init(&self) -> Result<(), ServiceError>;

    /// Reacts to a new value of one of the declared topics
    fn actuate(&self, topic: &str, state: &str) -> Result<(), ServiceError>;

    /// Called once after the service was detached and its update loop ended
    fn stop(&self) {}
}

/// Descriptor of a loaded service as listed by the API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    /// Artifact path
    pub name: String,
    pub service_name: String,
    pub version: String,
    /// Fully scoped topic names
    pub topics: Vec<String>,
}
