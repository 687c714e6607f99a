use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use moody_core::api::{ApiHandle, ApiState};
use moody_core::config::{Cli, GatewayConfig};
use moody_core::device::{ClientSettings, DeviceClient, DeviceEvent, DeviceRegistry};
use moody_core::discovery::DiscoveryMonitor;
use moody_core::mqtt::{MqttConfig, MqttHandle, TopicDataTable};
use moody_core::service::{DylibLoader, ServiceManager, ServiceMap};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let cli = Cli::parse();
    let config = GatewayConfig::resolve(&cli)
        .await
        .map_err(|e| eyre!("Invalid configuration: {}", e))?;
    banner(&config);

    let registry = Arc::new(DeviceRegistry::new());
    let table = Arc::new(TopicDataTable::new());
    let services = Arc::new(ServiceMap::new());
    let client = DeviceClient::new(ClientSettings::default())
        .map_err(|e| eyre!("Failed to build the device client: {}", e))?;

    let (events_tx, events_rx) = mpsc::channel(32);
    registry.attach(events_tx).await;
    let event_logger = log_registry_events(events_rx);

    let listener = TcpListener::bind(config.api_addr)
        .await
        .map_err(|e| eyre!("Failed to bind the API on {}: {}", config.api_addr, e))?;
    let api = ApiHandle::spawn(
        listener,
        ApiState {
            registry: registry.clone(),
            services: services.clone(),
        },
    )
    .map_err(|e| eyre!("Failed to start the API server: {}", e))?;

    let manager = ServiceManager::new(
        config.service_dir.clone(),
        Arc::new(DylibLoader),
        table.clone(),
        services.clone(),
        None,
    )
    .spawn();

    let mqtt = match connect_broker(&config, table.clone()).await {
        Ok(mqtt) => mqtt,
        Err(e) => {
            manager.stop().await;
            api.stop().await;
            return Err(e);
        }
    };

    let discovery = match DiscoveryMonitor::create(registry.clone(), client, None).start() {
        Ok(monitor) => Some(monitor),
        Err(e) => {
            warn!("Discovery disabled: {}", e);
            None
        }
    };

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to wait for Ctrl-C: {}", e))?;

    println!("moody-core - stopping");
    if let Some(discovery) = discovery {
        let idle = discovery.stop().await;
        let pending = idle.not_synced().await;
        if !pending.is_empty() {
            info!("Nodes never synchronized: {:?}", pending);
        }
    }
    manager.stop().await;
    mqtt.stop().await;
    api.stop().await;
    event_logger.abort();
    println!("Bye!");

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

fn banner(config: &GatewayConfig) {
    println!();
    println!("\tmoody-core v{}", env!("CARGO_PKG_VERSION"));
    println!("\tbroker   {}", config.broker);
    println!("\tapi      {}", config.api_addr);
    println!("\tservices {}", config.service_dir.display());
    println!();
}

async fn connect_broker(config: &GatewayConfig, table: Arc<TopicDataTable>) -> Result<MqttHandle> {
    let mqtt_config = MqttConfig::from_broker_string(&config.broker)
        .map_err(|e| eyre!("Invalid broker string: {}", e))?;
    MqttHandle::connect(mqtt_config, table)
        .await
        .map_err(|e| eyre!("Failed to start the MQTT transport: {}", e))
}

fn log_registry_events(mut events: mpsc::Receiver<DeviceEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                DeviceEvent::Added(address) => info!("Device {} joined", address),
                DeviceEvent::Removed(address) => info!("Device {} left", address),
            }
        }
    })
}
