//! # moody-core
//!
//! Gateway between a wireless network of sensor/actuator nodes, an MQTT broker and
//! an HTTP API, hosting hot-loaded service plugins that react to topic data.
//!
//! ```text
//!   SSDP ──► discovery ──► DeviceRegistry ◄── api ──► Sensor/Actuator ──HTTP──► nodes
//!
//!   broker ──► mqtt ──► TopicDataTable ──► service mailboxes ◄── ServiceManager ◄── plugin dir
//! ```
//!
//! Every shared structure is created once in `main` and handed to its users by
//! `Arc`; nothing is global.

pub mod api;
pub mod config;
pub mod device;
pub mod discovery;
pub mod mqtt;
pub mod service;
