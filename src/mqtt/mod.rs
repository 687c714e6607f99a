//! # MQTT Module
//!
//! Moves topic data between the broker and the services hosted by the gateway.
//!
//! ```text
//! mqtt/
//! ├── config.rs        - broker string parsing and the topic namespace
//! ├── data_table.rs    - latest value per topic, observer fan-out with cancellation
//! └── mqtt_handler.rs  - rumqttc client feeding the data table
//! ```
//!
//! ## Data flow
//!
//! ```text
//! broker ──publish moody/device/..──► MqttHandle ──add──► TopicDataTable ──► service mailboxes
//! ```
//!
//! The handler subscribes to [`config::BASE_TOPIC`] on every (re)connection, so the
//! table sees every device topic without per-service subscriptions on the broker.

pub mod config;
pub mod data_table;
pub mod mqtt_handler;

pub use config::{scoped_topic, MqttConfig, BASE_TOPIC};
pub use data_table::{TopicDataTable, TopicUpdate};
pub use mqtt_handler::{ConnectionState, MqttHandle};

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("invalid broker string: {0}")]
    InvalidBroker(String),

    /// Fatal at startup
    #[error("could not connect to the broker after {attempts} attempts: {reason}")]
    BrokerConnection { attempts: usize, reason: String },

    #[error("publish failed: {0}")]
    Publish(String),
}
