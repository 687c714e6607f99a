//! Latest-value table for MQTT topics with observer fan-out
//!
//! ```text
//! add(t, v) ──► [write lock] payload = v, cancel round(n-1), spawn round(n)
//!                                                        │
//!                              round(n): for each observer in attach order
//!                                           check cancel → blocking send
//! ```
//!
//! Every topic owns a delivery gate. A round delivers only while holding it and
//! stops at the first cancellation check after a newer [`TopicDataTable::add`], so
//! an observer can never receive a stale value after a fresher one. Observers that
//! do not drain their mailbox block the round that is feeding them, never the
//! table itself.

use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A single topic value as handed to observers
#[derive(Debug, Clone, PartialEq)]
pub struct TopicUpdate {
    pub topic: String,
    pub payload: String,
    pub received_at: DateTime<Local>,
}

impl TopicUpdate {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Local::now(),
        }
    }
}

type Observers = Arc<Mutex<Vec<mpsc::Sender<TopicUpdate>>>>;

#[derive(Debug, Default)]
struct TopicManager {
    payload: Option<String>,
    round: Option<CancellationToken>,
    observers: Observers,
    gate: Arc<Mutex<()>>,
}

/// Topic → latest payload map shared by the MQTT transport and the services
#[derive(Debug, Default)]
pub struct TopicDataTable {
    topics: RwLock<HashMap<String, TopicManager>>,
}

impl TopicDataTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `payload` as the latest value of `topic` and notifies its observers
    ///
    /// Returns once the value is stored; delivery happens in a background round that
    /// is abandoned as soon as a newer value for the same topic arrives.
    pub async fn add(&self, topic: &str, payload: impl Into<String>) {
        let update = TopicUpdate::new(topic, payload);

        let mut topics = self.topics.write().await;
        let manager = topics.entry(topic.to_string()).or_default();
        manager.payload = Some(update.payload.clone());

        if let Some(previous) = manager.round.take() {
            previous.cancel();
        }
        let round = CancellationToken::new();
        manager.round = Some(round.clone());

        tokio::spawn(notify_round(
            manager.observers.clone(),
            manager.gate.clone(),
            round,
            update,
        ));
    }

    /// Latest payload of `topic`, if one was ever added
    pub async fn get(&self, topic: &str) -> Option<String> {
        self.topics
            .read()
            .await
            .get(topic)
            .and_then(|manager| manager.payload.clone())
    }

    /// Adds `observer` to the fan-out of `topic`, creating the topic if needed
    pub async fn attach(&self, topic: &str, observer: mpsc::Sender<TopicUpdate>) {
        let observers = {
            let mut topics = self.topics.write().await;
            topics.entry(topic.to_string()).or_default().observers.clone()
        };
        observers.lock().await.push(observer);
        debug!("Observer attached to {}", topic);
    }

    /// Removes one registration of `observer` from `topic`
    ///
    /// Returns `false` if the observer was not attached.
    pub async fn detach(&self, topic: &str, observer: &mpsc::Sender<TopicUpdate>) -> bool {
        let Some(observers) = self
            .topics
            .read()
            .await
            .get(topic)
            .map(|manager| manager.observers.clone())
        else {
            return false;
        };

        let mut observers = observers.lock().await;
        match observers.iter().position(|o| o.same_channel(observer)) {
            Some(index) => {
                observers.remove(index);
                debug!("Observer detached from {}", topic);
                true
            }
            None => false,
        }
    }

    pub async fn topics(&self) -> Vec<String> {
        self.topics.read().await.keys().cloned().collect()
    }

    pub async fn observer_count(&self, topic: &str) -> usize {
        let observers = match self.topics.read().await.get(topic) {
            Some(manager) => manager.observers.clone(),
            None => return 0,
        };
        let count = observers.lock().await.len();
        count
    }
}

async fn notify_round(
    observers: Observers,
    gate: Arc<Mutex<()>>,
    round: CancellationToken,
    update: TopicUpdate,
) {
    let recipients = observers.lock().await.clone();
    if recipients.is_empty() {
        return;
    }

    let _gate = tokio::select! {
        biased;
        _ = round.cancelled() => return,
        guard = gate.lock() => guard,
    };

    for observer in recipients {
        if round.is_cancelled() {
            trace!("Round for {} superseded", update.topic);
            return;
        }
        tokio::select! {
            biased;
            _ = round.cancelled() => {
                trace!("Round for {} superseded mid-delivery", update.topic);
                return;
            }
            sent = observer.send(update.clone()) => {
                if sent.is_err() {
                    debug!("Observer of {} is gone, skipping", update.topic);
                }
            }
        }
    }
}
