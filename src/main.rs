//! MQTT session bridge runner
//!
//! Opens every session listed in the configuration file, subscribes the
//! configured topics through one [`MqttClient`] each and writes each bridge event to stdout as one JSON line.
//! Logs go to stderr.

use clap::{Parser, Subcommand};
use mqtt_bridge::observability::init_default_logging;
use mqtt_bridge::{
    BridgeConfig, BridgeEvent, EventBus, EventStream, MqttClient, RumqttEngineFactory,
    SessionRegistry,
};
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "mqtt-bridge")]
#[command(about = "Bridge MQTT sessions to a JSON event stream")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MQTT_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the configured sessions and stream their events
    Run,
    /// Validate the configuration file
    Config {
        /// Print the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting mqtt-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_bridge(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Bridge shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BridgeConfig::load_from_file(path)?);
    }

    for candidate in ["bridge.toml", "config/bridge.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BridgeConfig::load_from_file(&path)?);
        }
    }

    Err("no configuration file found; pass -c/--config or create bridge.toml".into())
}

/// Render an event as one stdout line stamped with the time it was observed
fn render_event(event: &BridgeEvent) -> Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(event)?;
    if let Some(fields) = value.as_object_mut() {
        fields.insert(
            "observedAt".to_string(),
            serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
        );
    }
    serde_json::to_string(&value)
}

async fn print_events(mut events: EventStream) {
    while let Some(event) = events.next().await {
        match render_event(&event) {
            Ok(line) => {
                let mut stdout = std::io::stdout().lock();
                if writeln!(stdout, "{line}").and_then(|_| stdout.flush()).is_err() {
                    break;
                }
            }
            Err(e) => warn!(event = %event.kind(), error = %e, "Failed to serialize event"),
        }
    }
}

async fn run_bridge(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let registry = Arc::new(SessionRegistry::with_event_bus(
        Arc::new(RumqttEngineFactory),
        EventBus::new(config.event_capacity),
    ));
    let printer = tokio::spawn(print_events(registry.event_bus().subscribe()));

    let mut clients = Vec::with_capacity(config.sessions.len());
    for section in &config.sessions {
        let client = MqttClient::create(registry.clone(), section.to_session_config()?).await?;
        info!(session = %section.name, client_ref = %client.reference(), "Opening session");

        let name = section.name.clone();
        client.on_error(move |error| {
            warn!(session = %name, code = error.error_code, "{}", error.error_message)
        });

        match client.connect().await {
            Ok(()) if !section.subscriptions.is_empty() => {
                if let Err(e) = client.subscribe(&section.subscriptions).await {
                    warn!(session = %section.name, error = %e, "Subscribe failed");
                }
            }
            Ok(()) => {}
            Err(e) => error!(session = %section.name, error = %e, "Connect failed"),
        }
        clients.push(client);
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!(sessions = registry.len().await, "Bridge is running");

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }

    for mut client in clients {
        if let Err(e) = client.end(false).await {
            warn!(client_ref = %client.reference(), error = %e, "Failed to end session");
        }
    }
    registry.end_all(true).await;
    drop(registry);
    // the printer drains remaining events and stops once the bus closes
    if tokio::time::timeout(Duration::from_secs(2), printer).await.is_err() {
        warn!("Event printer did not drain in time");
    }
    Ok(())
}

fn handle_config_command(
    config: &BridgeConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    for section in &config.sessions {
        let resolved = section.to_session_config()?;
        info!(session = %section.name, broker = %resolved.broker_uri(), "Session resolved");
    }

    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
