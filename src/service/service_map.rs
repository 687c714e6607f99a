use super::{ServiceHandle, ServiceInfo};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::warn;

/// Live services keyed by artifact path
///
/// Guarded by its own lock, independent of the topic table.
#[derive(Debug, Default)]
pub struct ServiceMap {
    services: RwLock<HashMap<PathBuf, ServiceHandle>>,
}

impl ServiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` under its artifact path
    ///
    /// A handle already registered for the same path is returned unchanged so the
    /// caller can stop it.
    pub async fn add(&self, handle: ServiceHandle) -> Option<ServiceHandle> {
        let path = handle.path().to_path_buf();
        let previous = self.services.write().await.insert(path, handle);
        if let Some(previous) = &previous {
            warn!("Replacing service registered for {}", previous.path().display());
        }
        previous
    }

    pub async fn remove(&self, path: &Path) -> Option<ServiceHandle> {
        self.services.write().await.remove(path)
    }

    pub async fn contains(&self, path: &Path) -> bool {
        self.services.read().await.contains_key(path)
    }

    pub async fn get(&self, path: &Path) -> Option<ServiceInfo> {
        self.services
            .read()
            .await
            .get(path)
            .map(|handle| handle.info().clone())
    }

    /// Snapshot of every loaded service, ordered by artifact path
    pub async fn list(&self) -> Vec<ServiceInfo> {
        let services = self.services.read().await;
        let mut infos: Vec<ServiceInfo> = services.values().map(|h| h.info().clone()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub async fn len(&self) -> usize {
        self.services.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Removes and returns every handle
    pub async fn drain(&self) -> Vec<ServiceHandle> {
        self.services
            .write()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::plugin::tests::Recorder;
    use std::sync::Arc;

    fn handle(path: &str, name: &str) -> ServiceHandle {
        ServiceHandle::new(Path::new(path), Arc::new(Recorder::new(name, &["t"])), 1)
    }

    #[tokio::test]
    async fn test_add_list_remove() {
        let map = ServiceMap::new();
        assert!(map.add(handle("/s/b.so", "b")).await.is_none());
        assert!(map.add(handle("/s/a.so", "a")).await.is_none());

        let names: Vec<String> = map.list().await.into_iter().map(|i| i.service_name).collect();
        assert_eq!(names, vec!["a", "b"]);

        let removed = map.remove(Path::new("/s/a.so")).await.unwrap();
        assert_eq!(removed.info().service_name, "a");
        assert!(!map.contains(Path::new("/s/a.so")).await);
        assert!(map.remove(Path::new("/s/a.so")).await.is_none());
        assert_eq!(map.len().await, 1);
    }

    #[tokio::test]
    async fn test_add_same_path_returns_previous() {
        let map = ServiceMap::new();
        map.add(handle("/s/a.so", "first")).await;
        let previous = map.add(handle("/s/a.so", "second")).await.unwrap();

        assert_eq!(previous.info().service_name, "first");
        let current = map.get(Path::new("/s/a.so")).await.unwrap();
        assert_eq!(current.service_name, "second");
    }

    #[tokio::test]
    async fn test_drain_empties_map() {
        let map = ServiceMap::new();
        map.add(handle("/s/a.so", "a")).await;
        map.add(handle("/s/b.so", "b")).await;

        assert_eq!(map.drain().await.len(), 2);
        assert!(map.is_empty().await);
    }
}
