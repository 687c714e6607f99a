use super::config::{MqttConfig, BASE_TOPIC};
use super::data_table::TopicDataTable;
use super::MqttError;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Running broker connection
///
/// Created by [`MqttHandle::connect`]; the event loop keeps running (and
/// reconnecting) in a background task until [`MqttHandle::stop`].
#[derive(Debug)]
pub struct MqttHandle {
    client: AsyncClient,
    config: MqttConfig,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MqttHandle {
    /// Connects to the broker and starts forwarding device topics into `table`
    ///
    /// Makes up to `connection_retries` attempts, pausing `retry_delay` between
    /// them.
    ///
    /// # Errors
    ///
    /// * [`MqttError::BrokerConnection`] - no attempt reached the broker
    pub async fn connect(
        config: MqttConfig,
        table: Arc<TopicDataTable>,
    ) -> Result<Self, MqttError> {
        let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive);

        let (client, mut event_loop) = AsyncClient::new(options, config.capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        Self::await_connack(&config, &client, &mut event_loop).await?;
        state_tx.send_replace(ConnectionState::Connected);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_event_loop(
            client.clone(),
            event_loop,
            table,
            config.clone(),
            cancel.clone(),
            state_tx,
        ));

        Ok(Self {
            client,
            config,
            state: state_rx,
            cancel,
            task,
        })
    }

    async fn await_connack(
        config: &MqttConfig,
        client: &AsyncClient,
        event_loop: &mut EventLoop,
    ) -> Result<(), MqttError> {
        let mut reason = String::from("no attempt made");
        for attempt in 1..=config.connection_retries {
            info!(
                "Attempting connection #{} to the broker @{}",
                attempt,
                config.broker_url()
            );
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to the broker @{}", config.broker_url());
                        subscribe(client);
                        return Ok(());
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Connection attempt #{} failed: {}", attempt, e);
                        reason = e.to_string();
                        break;
                    }
                }
            }
            tokio::time::sleep(config.retry_delay).await;
        }

        error!(
            "Giving up on the broker @{} after {} attempts",
            config.broker_url(),
            config.connection_retries
        );
        Err(MqttError::BrokerConnection {
            attempts: config.connection_retries,
            reason,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    /// Publishes a retained QoS 0 message
    pub async fn publish(&self, topic: &str, payload: &str) -> Result<(), MqttError> {
        self.client
            .publish(topic, QoS::AtMostOnce, true, payload.as_bytes().to_vec())
            .await
            .map_err(|e| MqttError::Publish(e.to_string()))
    }

    /// Unsubscribes, disconnects and waits for the event loop to wind down
    pub async fn stop(self) {
        info!("Stopping the MQTT transport");
        if let Err(e) = self.client.unsubscribe(BASE_TOPIC).await {
            warn!("Unsubscribe from {} failed: {}", BASE_TOPIC, e);
        }
        if let Err(e) = self.client.disconnect().await {
            warn!("Disconnect request failed: {}", e);
        }
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("MQTT event loop ended abnormally: {}", e);
        }
    }
}

fn subscribe(client: &AsyncClient) {
    match client.try_subscribe(BASE_TOPIC, QoS::AtMostOnce) {
        Ok(()) => info!("Subscribed to {}", BASE_TOPIC),
        Err(e) => error!("Could not subscribe to {}: {}", BASE_TOPIC, e),
    }
}

async fn run_event_loop(
    client: AsyncClient,
    mut event_loop: EventLoop,
    table: Arc<TopicDataTable>,
    config: MqttConfig,
    cancel: CancellationToken,
    state: watch::Sender<ConnectionState>,
) {
    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = event_loop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                debug!(
                    "Received MQTT message on {} with payload {}",
                    publish.topic, payload
                );
                table.add(&publish.topic, payload).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Reconnected to the broker @{}", config.broker_url());
                state.send_replace(ConnectionState::Connected);
                subscribe(&client);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    "Lost connection with the broker @{}, trying to reconnect: {}",
                    config.broker_url(),
                    e
                );
                state.send_replace(ConnectionState::Reconnecting);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.retry_delay) => {}
                }
            }
        }
    }

    flush_disconnect(&mut event_loop).await;
    state.send_replace(ConnectionState::Disconnected);
    debug!("MQTT event loop stopped");
}

/// Lets the queued unsubscribe/disconnect requests reach the broker
async fn flush_disconnect(event_loop: &mut EventLoop) {
    let drained = tokio::time::timeout(DISCONNECT_GRACE, async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if drained.is_err() {
        debug!("Broker did not confirm the disconnect in time");
    }
}
