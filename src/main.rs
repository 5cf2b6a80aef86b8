//! mb-subscriber - Main Entry Point
//!
//! Subscribes to the configured topic across the configured brokers and logs
//! every event it has a handler for.

use clap::{Parser, Subcommand};
use mb_subscriber::config::SubscriberConfig;
use mb_subscriber::error::HandlerResult;
use mb_subscriber::observability::logging::{init_logging, parse_level, LogFormat};
use mb_subscriber::subscriber::{EventSubscriber, InboundMessage};
use std::env;
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tracing::{error, info, warn, Level};

/// Resilient MQTT event subscriber
#[derive(Parser)]
#[command(name = "mb-subscriber")]
#[command(about = "Subscribe to a topic across redundant MQTT brokers and dispatch events")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MB_SUBSCRIBER_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace); overrides LOG_LEVEL
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe and log received events until interrupted
    Run {
        /// Event name to log (last topic segment); repeat for several
        #[arg(short, long = "event", value_name = "NAME")]
        events: Vec<String>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["mb-subscriber.toml", "config/mb-subscriber.toml"];

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(
        log_level(cli.verbose),
        LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string())),
        env::var("LOG_SPANS")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
    ) {
        eprintln!("Failed to initialize logging: {e}");
    }

    info!("Starting mb-subscriber v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { events } => run_subscriber(config, events).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn log_level(verbose: u8) -> Level {
    match verbose {
        0 => parse_level(&env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string())),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn load_configuration(
    config_path: Option<&Path>,
) -> Result<SubscriberConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(SubscriberConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = Path::new(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(SubscriberConfig::load_from_file(path)?);
        }
    }

    Err(format!(
        "No configuration file found. Provide one with -c/--config or create {}",
        DEFAULT_CONFIG_PATHS[0]
    )
    .into())
}

async fn run_subscriber(
    config: SubscriberConfig,
    events: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = EventSubscriber::from_config(&config)?;

    if events.is_empty() {
        warn!("No --event given; every received message will be discarded");
    }
    for event in events {
        info!(event = %event, "Logging events");
        subscriber.register_handler(event, log_event);
    }

    let handle = subscriber.start()?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!(topic = %config.subscriber.topic, "Subscriber running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    handle.shutdown().await?;
    info!(
        metrics = %serde_json::to_string(&subscriber.metrics())?,
        "Final subscriber metrics"
    );
    Ok(())
}

/// Handler that logs the event, pretty-printing JSON payloads
async fn log_event(message: InboundMessage) -> HandlerResult {
    let body = match serde_json::from_slice::<serde_json::Value>(&message.payload) {
        Ok(json) => serde_json::to_string_pretty(&json)?,
        Err(_) => message.payload_str().into_owned(),
    };

    info!(
        event = %message.event_name(),
        topic = %message.topic,
        received_at = %message.received_at,
        "{body}"
    );
    Ok(())
}

fn handle_config_command(
    config: &SubscriberConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    let credentials = if config.get_credentials().is_some() {
        "resolved"
    } else {
        "none"
    };
    info!(
        brokers = config.subscriber.brokers.len(),
        credentials, "Configuration validation complete"
    );
    Ok(())
}
