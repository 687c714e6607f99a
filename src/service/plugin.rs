use super::{MoodyService, ServiceError, ServiceInfo};
use crate::mqtt::{scoped_topic, TopicDataTable, TopicUpdate};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A loaded service wired to its mailbox
///
/// ```text
/// TopicDataTable ──[TopicUpdate]──► mailbox ──► update loop ──► service.actuate
/// ```
///
/// Updates are handed to the service one at a time, in mailbox order.
pub struct ServiceHandle {
    path: PathBuf,
    info: ServiceInfo,
    service: Arc<dyn MoodyService>,
    sender: mpsc::Sender<TopicUpdate>,
    receiver: Option<mpsc::Receiver<TopicUpdate>>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("path", &self.path)
            .field("info", &self.info)
            .field("running", &self.task.is_some())
            .finish()
    }
}

impl ServiceHandle {
    pub fn new(path: &Path, service: Arc<dyn MoodyService>, mailbox_capacity: usize) -> Self {
        let info = ServiceInfo {
            name: path.display().to_string(),
            service_name: service.name().to_string(),
            version: service.version().to_string(),
            topics: service.topics().iter().map(|t| scoped_topic(t)).collect(),
        };
        let (sender, receiver) = mpsc::channel(mailbox_capacity.max(1));
        Self {
            path: path.to_path_buf(),
            info,
            service,
            sender,
            receiver: Some(receiver),
            task: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &ServiceInfo {
        &self.info
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Runs the service initializer on a blocking thread
    pub async fn init(&self) -> Result<(), ServiceError> {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || service.init())
            .await
            .map_err(|e| ServiceError::Init {
                name: self.info.service_name.clone(),
                reason: e.to_string(),
            })?
    }

    /// Attaches the mailbox to every declared topic
    pub async fn subscribe(&self, table: &TopicDataTable) {
        for topic in &self.info.topics {
            table.attach(topic, self.sender.clone()).await;
        }
    }

    /// Starts the update loop; does nothing if it already runs
    pub fn listen_for_updates(&mut self) {
        let Some(mut receiver) = self.receiver.take() else {
            return;
        };
        let service = self.service.clone();
        let name = self.info.service_name.clone();

        info!("Service {} starting", name);
        self.task = Some(tokio::spawn(async move {
            while let Some(update) = receiver.recv().await {
                let service = service.clone();
                let topic = update.topic.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    service.actuate(&update.topic, &update.payload)
                })
                .await;

                match outcome {
                    Ok(Ok(())) => debug!("Service {} handled {}", name, topic),
                    Ok(Err(e)) => warn!("Service {} failed on {}: {}", name, topic, e),
                    Err(e) => error!("Service {} panicked on {}: {}", name, topic, e),
                }
            }
            debug!("Update loop of {} ended", name);
        }));
    }

    /// Detaches from every topic, closes the mailbox and stops the service
    ///
    /// Detaching comes first so no notification round can target the mailbox once
    /// it is closed. An update already queued is still handled.
    pub async fn stop(self, table: &TopicDataTable) {
        info!("Service {} stopping", self.info.service_name);
        for topic in &self.info.topics {
            if !table.detach(topic, &self.sender).await {
                debug!("{} was not attached to {}", self.info.service_name, topic);
            }
        }

        let ServiceHandle {
            sender,
            receiver,
            task,
            service,
            ..
        } = self;
        drop(sender);
        drop(receiver);

        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Update loop ended abnormally: {}", e);
            }
        }
        if let Err(e) = tokio::task::spawn_blocking(move || service.stop()).await {
            error!("Service stop panicked: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Service recording every callback
    #[derive(Default)]
    pub struct Recorder {
        pub name: String,
        pub topics: Vec<String>,
        pub fail_init: bool,
        pub inits: AtomicUsize,
        pub stops: AtomicUsize,
        pub actuated: Mutex<Vec<(String, String)>>,
    }

    impl Recorder {
        pub fn new(name: &str, topics: &[&str]) -> Self {
            Self {
                name: name.to_string(),
                topics: topics.iter().map(|t| t.to_string()).collect(),
                ..Self::default()
            }
        }

        pub fn actuated(&self) -> Vec<(String, String)> {
            self.actuated.lock().unwrap().clone()
        }
    }

    impl MoodyService for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn version(&self) -> &str {
            "0.1.0"
        }

        fn topics(&self) -> Vec<String> {
            self.topics.clone()
        }

        fn init(&self) -> Result<(), ServiceError> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                return Err(ServiceError::Init {
                    name: self.name.clone(),
                    reason: "refused".to_string(),
                });
            }
            Ok(())
        }

        fn actuate(&self, topic: &str, state: &str) -> Result<(), ServiceError> {
            self.actuated
                .lock()
                .unwrap()
                .push((topic.to_string(), state.to_string()));
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn wait_for(check: impl Fn() -> bool) -> bool {
        for _ in 0..40 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        check()
    }

    #[test]
    fn test_topics_are_scoped() {
        let service = Arc::new(Recorder::new("lamp", &["lamp/state", "/temp"]));
        let handle = ServiceHandle::new(Path::new("/srv/lamp.so"), service, 4);

        assert_eq!(handle.info().name, "/srv/lamp.so");
        assert_eq!(handle.info().service_name, "lamp");
        assert_eq!(
            handle.info().topics,
            vec!["moody/device/lamp/state", "moody/device/temp"]
        );
    }

    #[tokio::test]
    async fn test_updates_reach_service_in_order() {
        let table = TopicDataTable::new();
        let service = Arc::new(Recorder::new("lamp", &["lamp/state"]));
        let mut handle = ServiceHandle::new(Path::new("/srv/lamp.so"), service.clone(), 4);

        handle.init().await.unwrap();
        handle.subscribe(&table).await;
        handle.listen_for_updates();
        assert!(handle.is_running());

        table.add("moody/device/lamp/state", "on").await;
        assert!(wait_for(|| service.actuated().len() == 1).await);
        table.add("moody/device/lamp/state", "off").await;
        assert!(wait_for(|| service.actuated().len() == 2).await);

        assert_eq!(
            service.actuated(),
            vec![
                ("moody/device/lamp/state".to_string(), "on".to_string()),
                ("moody/device/lamp/state".to_string(), "off".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_detaches_and_stops_once() {
        let table = TopicDataTable::new();
        let service = Arc::new(Recorder::new("lamp", &["a", "b"]));
        let mut handle = ServiceHandle::new(Path::new("/srv/lamp.so"), service.clone(), 4);
        handle.subscribe(&table).await;
        handle.listen_for_updates();
        assert_eq!(table.observer_count("moody/device/a").await, 1);

        handle.stop(&table).await;

        assert_eq!(table.observer_count("moody/device/a").await, 0);
        assert_eq!(table.observer_count("moody/device/b").await, 0);
        assert_eq!(service.stops.load(Ordering::SeqCst), 1);

        table.add("moody/device/a", "late").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(service.actuated().is_empty());
    }

    #[tokio::test]
    async fn test_failing_init_is_reported() {
        let service = Arc::new(Recorder {
            fail_init: true,
            ..Recorder::new("broken", &[])
        });
        let handle = ServiceHandle::new(Path::new("/srv/broken.so"), service, 4);

        assert!(matches!(handle.init().await, Err(ServiceError::Init { .. })));
    }
}
