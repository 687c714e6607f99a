use super::MqttError;
use std::time::Duration;

/// Wildcard root every device and service topic lives under
pub const BASE_TOPIC: &str = "moody/device/#";

pub const DEFAULT_BROKER_PORT: u16 = 1883;

/// Prefix of [`BASE_TOPIC`] without the wildcard
pub fn topic_prefix() -> &'static str {
    BASE_TOPIC.trim_end_matches('#')
}

/// Joins a service-declared topic suffix onto the device namespace
pub fn scoped_topic(suffix: &str) -> String {
    format!("{}{}", topic_prefix(), suffix.trim_start_matches('/'))
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    /// Connection attempts before startup gives up
    pub connection_retries: usize,
    pub retry_delay: Duration,
    /// Capacity of the request queue between client and event loop
    pub capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_BROKER_PORT,
            client_id: "moody-recv".to_string(),
            keep_alive: Duration::from_secs(5),
            connection_retries: 5,
            retry_delay: Duration::from_secs(1),
            capacity: 100,
        }
    }
}

impl MqttConfig {
    /// Parses a `<scheme>://<host>:<port>` broker string
    ///
    /// The scheme is optional and the port defaults to 1883.
    pub fn from_broker_string(broker: &str) -> Result<Self, MqttError> {
        let invalid = || MqttError::InvalidBroker(broker.to_string());

        let authority = match broker.split_once("://") {
            Some((scheme, rest)) => match scheme {
                "tcp" | "mqtt" => rest,
                _ => return Err(invalid()),
            },
            None => broker,
        };
        let authority = authority.trim_end_matches('/');

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (authority, DEFAULT_BROKER_PORT),
        };
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            port,
            ..Self::default()
        })
    }

    pub fn broker_url(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_string() {
        let config = MqttConfig::from_broker_string("tcp://localhost:1883").unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 1883);
        assert_eq!(config.client_id, "moody-recv");

        let config = MqttConfig::from_broker_string("mqtt://10.0.0.5:8883").unwrap();
        assert_eq!(config.broker_url(), "tcp://10.0.0.5:8883");

        let config = MqttConfig::from_broker_string("broker.local").unwrap();
        assert_eq!(config.port, DEFAULT_BROKER_PORT);
    }

    #[test]
    fn test_invalid_broker_string() {
        for broker in ["ws://host:1883", "tcp://host:port", "tcp://:1883", ""] {
            assert!(
                matches!(MqttConfig::from_broker_string(broker), Err(MqttError::InvalidBroker(_))),
                "{} should be rejected",
                broker
            );
        }
    }

    #[test]
    fn test_scoped_topic() {
        assert_eq!(topic_prefix(), "moody/device/");
        assert_eq!(scoped_topic("lamp/state"), "moody/device/lamp/state");
        assert_eq!(scoped_topic("/temp"), "moody/device/temp");
    }
}
