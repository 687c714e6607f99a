//! Command line and config file
//!
//! Every setting has a CLI flag with a default. A config file (`-c`), JSON or TOML
//! by extension, overrides the flags field by field:
//!
//! ```json
//! { "brokerString": "tcp://localhost:1883", "apiPort": ":8080", "serviceDir": "~/moody-services" }
//! ```

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEFAULT_BROKER: &str = "tcp://localhost:1883";
pub const DEFAULT_API_PORT: &str = ":8080";
pub const DEFAULT_SERVICE_DIR: &str = "./services";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("unsupported config format: {0} (expected .json or .toml)")]
    UnsupportedFormat(PathBuf),

    #[error("invalid API address: {0}")]
    InvalidApiAddress(String),
}

#[derive(Parser, Debug, Clone)]
#[command(name = "moody-core", version, about = "the moody core engine")]
pub struct Cli {
    /// Broker connection string in the <scheme>://<host>:<port> format
    #[arg(short, long, env = "MOODY_BROKER", default_value = DEFAULT_BROKER)]
    pub broker: String,

    /// API listen address, as :<port>, <port> or <host>:<port>
    #[arg(short, long, env = "MOODY_API_PORT", default_value = DEFAULT_API_PORT)]
    pub port: String,

    /// Directory the services are loaded from
    #[arg(short, long, env = "MOODY_SERVICE_DIR", default_value = DEFAULT_SERVICE_DIR)]
    pub service_dir: String,

    /// JSON or TOML file overriding the flags above
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// Contents of a config file; absent keys keep the CLI value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    pub broker_string: Option<String>,
    pub api_port: Option<String>,
    pub service_dir: Option<String>,
}

impl FileConfig {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(path, &content)
    }

    fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        let parse_error = |reason: String| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        };
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(content).map_err(|e| parse_error(e.to_string())),
            Some("toml") => toml::from_str(content).map_err(|e| parse_error(e.to_string())),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// Fully resolved gateway settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub broker: String,
    pub api_addr: SocketAddr,
    pub service_dir: PathBuf,
}

impl GatewayConfig {
    /// Applies the config file named by `cli`, if any, over the CLI values
    pub async fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        let mut broker = cli.broker.clone();
        let mut api_port = cli.port.clone();
        let mut service_dir = cli.service_dir.clone();

        if let Some(path) = &cli.config {
            info!("Loading configuration from {}", path.display());
            let file = FileConfig::load(path).await?;
            if let Some(value) = file.broker_string {
                broker = value;
            }
            if let Some(value) = file.api_port {
                api_port = value;
            }
            if let Some(value) = file.service_dir {
                service_dir = value;
            }
        }

        let config = Self {
            broker,
            api_addr: parse_api_addr(&api_port)?,
            service_dir: expand_home(&service_dir),
        };
        debug!("Resolved configuration: {:?}", config);
        Ok(config)
    }
}

/// Accepts `:8080`, `8080` and `host:port`
pub fn parse_api_addr(value: &str) -> Result<SocketAddr, ConfigError> {
    let invalid = || ConfigError::InvalidApiAddress(value.to_string());
    let value = value.trim();

    let (host, port) = match value.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => ("", value),
    };
    let port: u16 = port.parse().map_err(|_| invalid())?;

    let ip = match host.trim_start_matches('[').trim_end_matches(']') {
        "" => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        "localhost" => IpAddr::V4(Ipv4Addr::LOCALHOST),
        other => other.parse().map_err(|_| invalid())?,
    };
    Ok(SocketAddr::new(ip, port))
}

/// Expands a leading `~/` against the home directory
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => {
                warn!("Could not determine home directory, using {} as is", path);
                PathBuf::from(path)
            }
        },
        None => PathBuf::from(path),
    }
}
