//! Pushok hub to MQTT bridge.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pushok_bridge::{BridgeConfig, MqttBridge};
use pushok_hub::config::parse_flag;
use pushok_hub::{EntityType, HubAuth, HubClient, HubConfig, HubService, WebSocketConnector};
use tracing::{info, warn};

const LOG_JSON_ENV: &str = "PUSHOK_LOG_JSON";

/// Expose Pushok hub devices over MQTT.
#[derive(Parser, Debug)]
#[command(name = "pushok-bridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// TOML configuration file. Without it, settings come from the environment.
    #[arg(short, long, global = true, env = "PUSHOK_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Pushok hub host.
    #[arg(long, global = true)]
    hub_host: Option<String>,

    /// Pushok hub port.
    #[arg(long, global = true)]
    hub_port: Option<u16>,

    /// MQTT broker host.
    #[arg(long, global = true)]
    mqtt_host: Option<String>,

    /// MQTT broker port.
    #[arg(long, global = true)]
    mqtt_port: Option<u16>,

    /// Log level (trace, debug, info, warning, error).
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the bridge (default).
    Run,
    /// Print a new hub identity (private key and user id).
    Keygen,
    /// Connect to the hub, authenticate, list devices and exit.
    Probe,
}

impl Args {
    fn load_config(&self) -> Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let mut config = BridgeConfig::from_file(path)
                    .with_context(|| format!("loading {}", path.display()))?;
                config.apply_env();
                config
            }
            None => BridgeConfig::from_env(),
        };
        self.apply_overrides(&mut config);
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut BridgeConfig) {
        if let Some(host) = &self.hub_host {
            config.hub.host = host.clone();
        }
        if let Some(port) = self.hub_port {
            config.hub.port = port;
        }
        if let Some(host) = &self.mqtt_host {
            config.mqtt.host = host.clone();
        }
        if let Some(port) = self.mqtt_port {
            config.mqtt.port = port;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

fn init_logging(level: &str) {
    let json_logging = std::env::var(LOG_JSON_ENV)
        .ok()
        .and_then(|v| parse_flag(&v))
        .unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "warn,pushok_hub={0},pushok_bridge={0}",
            level
        ))
    });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.command == Some(Command::Keygen) {
        let auth = HubAuth::generate();
        println!("private_key = \"{}\"", auth.private_key_hex());
        println!("user_id = \"{}\"", auth.user_id_b64());
        return Ok(());
    }

    let config = args.load_config()?;
    init_logging(config.log_directive());

    match args.command.unwrap_or(Command::Run) {
        Command::Probe => probe(&config.hub).await,
        _ => run(config).await,
    }
}

/// Build the hub service, generating an identity when none is configured.
fn hub_service(config: &HubConfig) -> Result<Arc<HubService>> {
    let auth = HubAuth::new(config.private_key.as_deref(), config.user_id.as_deref())
        .context("invalid hub identity")?;

    if config.private_key.is_none() || config.user_id.is_none() {
        warn!("No hub identity configured; generated a new one. Save it to keep access:");
        println!("[hub]");
        println!("private_key = \"{}\"", auth.private_key_hex());
        println!("user_id = \"{}\"", auth.user_id_b64());
    }

    let url = config.websocket_url();
    info!(url = %url, "Using hub endpoint");
    let connector = WebSocketConnector::new(url, config.ping_interval());
    let client = HubClient::new(Arc::new(connector), auth)
        .with_command_timeout(config.command_timeout());
    Ok(HubService::with_options(
        Arc::new(client),
        EntityType::Zigbee,
        config.reconnect_interval(),
    ))
}

async fn run(config: BridgeConfig) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Pushok MQTT bridge");

    let service = hub_service(&config.hub)?;
    if !service.setup().await {
        warn!("Hub not reachable yet; the bridge will publish devices once it connects");
    }

    let bridge = MqttBridge::new(&config.mqtt, service.clone());
    let result = bridge.run(shutdown_signal()).await;

    service.shutdown().await;
    info!("Bridge stopped");
    result.map_err(Into::into)
}

async fn probe(config: &HubConfig) -> Result<()> {
    let service = hub_service(config)?;
    let client = service.client();
    client.connect().await.context("hub handshake failed")?;
    println!("Authenticated as {:?}", client.role());

    let count = service.load_devices().await.context("listing devices")?;
    println!("{} device(s):", count);
    for snapshot in service.snapshots().await {
        let device = &snapshot.device;
        let name = snapshot
            .attributes
            .as_ref()
            .and_then(|a| a.name.clone())
            .unwrap_or_default();
        println!(
            "  {:<24} {:<20} {:<16} {}",
            device.id, device.model, device.manufacturer, name
        );
    }

    service.shutdown().await;
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_run() {
        let args = Args::try_parse_from(["pushok-bridge"]).unwrap();
        assert_eq!(args.command, None);
        assert_eq!(args.command.unwrap_or(Command::Run), Command::Run);
    }

    #[test]
    fn test_overrides_win_over_config() {
        let args = Args::try_parse_from([
            "pushok-bridge",
            "run",
            "--hub-host",
            "192.168.1.7",
            "--mqtt-port",
            "8883",
            "--log-level",
            "DEBUG",
        ])
        .unwrap();
        assert_eq!(args.command, Some(Command::Run));

        let mut config = BridgeConfig::default();
        args.apply_overrides(&mut config);
        assert_eq!(config.hub.host, "192.168.1.7");
        assert_eq!(config.hub.port, 3001);
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.log_directive(), "debug");
    }

    #[test]
    fn test_rejects_bad_port() {
        assert!(Args::try_parse_from(["pushok-bridge", "--hub-port", "70000"]).is_err());
    }
}
