use moody_core::mqtt::{scoped_topic, TopicDataTable};
use moody_core::service::{MoodyService, ServiceError, ServiceManager, ServiceMap, StaticLoader};
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Thermostat {
    seen: Mutex<Vec<(String, String)>>,
}

impl MoodyService for Thermostat {
    fn name(&self) -> &str {
        "thermostat"
    }

    fn version(&self) -> &str {
        "0.2.0"
    }

    fn topics(&self) -> Vec<String> {
        vec!["living/temp".to_string()]
    }

    fn init(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    fn actuate(&self, topic: &str, state: &str) -> Result<(), ServiceError> {
        state
            .parse::<f64>()
            .map_err(|e| ServiceError::Actuate(e.to_string()))?;
        self.seen
            .lock()
            .unwrap()
            .push((topic.to_string(), state.to_string()));
        Ok(())
    }
}

#[tokio::test]
async fn topic_updates_reach_loaded_service() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("thermostat.so"), b"").unwrap();

    let service = Arc::new(Thermostat::default());
    let shared = service.clone();
    let table = Arc::new(TopicDataTable::new());
    let manager = ServiceManager::new(
        dir.path(),
        Arc::new(StaticLoader::new().with("thermostat", move || shared.clone())),
        table.clone(),
        Arc::new(ServiceMap::new()),
        None,
    );
    manager.reconcile().await;

    let topic = scoped_topic("living/temp");
    table.add(&topic, "not a number").await;
    table.add("moody/device/kitchen/temp", "19.0").await;
    table.add(&topic, "21.5").await;

    let mut delivered = Vec::new();
    for _ in 0..40 {
        delivered = service.seen.lock().unwrap().clone();
        if !delivered.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert_eq!(delivered.last(), Some(&(topic.clone(), "21.5".to_string())));
    assert!(delivered.iter().all(|(t, _)| *t == topic));
    assert_eq!(table.get(&topic).await.as_deref(), Some("21.5"));

    manager.stop_all().await;
    assert_eq!(table.observer_count(&topic).await, 0);
}
