//! PID Connector - command-line entry point
//!
//! Publishes JSON documents through the resilient connector, checks broker
//! connectivity, or validates the configuration.

use clap::{Parser, Subcommand};
use pid_connector::broker::{check_connectivity, AmqpBroker};
use pid_connector::config::PublisherConfig;
use pid_connector::message::PendingMessage;
use pid_connector::observability::{init_logging, LogSettings};
use pid_connector::AsynchronousConnector;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["pid-connector.toml", "config/pid-connector.toml"];

/// Resilient AMQP publisher for PID registration events
#[derive(Parser)]
#[command(name = "pid-connector")]
#[command(about = "Resilient AMQP publisher for PID registration events")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "PID_CONNECTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish JSON documents, one per line, from a file or stdin
    Publish {
        #[arg(short, long)]
        routing_key: String,

        /// Read from this file instead of stdin
        #[arg(short, long, value_name = "PATH")]
        file: Option<PathBuf>,
    },
    /// Connect to every configured node and report whether it is usable
    Check,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    init_logging(LogSettings::from_env().with_verbosity(cli.verbose));
    info!("Starting pid-connector v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Publish { routing_key, file } => publish(&config, &routing_key, file.as_deref()),
        Commands::Check => check(&config),
        Commands::Config { show } => handle_config_command(&config, show),
    };

    match result {
        Ok(true) => info!("Done"),
        Ok(false) => process::exit(1),
        Err(e) => {
            error!("Command failed: {}", e);
            process::exit(1);
        }
    }
}

fn load_configuration(path: Option<&Path>) -> Result<PublisherConfig, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Ok(PublisherConfig::load_from_file(path)?);
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(PublisherConfig::load_from_file(path)?);
        }
    }

    Err(format!(
        "No configuration file found. Provide one with -c/--config or create {}",
        DEFAULT_CONFIG_PATHS[0]
    )
    .into())
}

fn read_documents<R: BufRead>(
    reader: R,
    routing_key: &str,
) -> Result<Vec<PendingMessage>, Box<dyn std::error::Error>> {
    let mut messages = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let body = serde_json::from_str(&line)
            .map_err(|e| format!("line {}: invalid JSON: {}", number + 1, e))?;
        messages.push(PendingMessage::new(routing_key, body));
    }
    Ok(messages)
}

/// Returns false when messages were left over
fn publish(
    config: &PublisherConfig,
    routing_key: &str,
    file: Option<&Path>,
) -> Result<bool, Box<dyn std::error::Error>> {
    let messages = match file {
        Some(path) => read_documents(BufReader::new(File::open(path)?), routing_key)?,
        None => read_documents(io::stdin().lock(), routing_key)?,
    };

    let mut connector = AsynchronousConnector::from_config(config)?;
    connector.start()?;
    let queued = connector.enqueue_many(messages)?;
    info!(queued, routing_key, "Messages queued");

    let settings = config.connector_settings();
    let patience = (settings.connection_timeout + settings.reconnect_delay)
        * settings.max_sweeps.max(1)
        * u32::try_from(config.nodes.len()).unwrap_or(u32::MAX).max(1);
    if !connector.wait_until_available(patience) {
        warn!("No broker node became available");
    }
    connector.finish_gracefully()?;

    let leftovers = connector.get_leftovers()?;
    println!("published: {}", queued.saturating_sub(leftovers.len()));
    println!("leftovers: {}", leftovers.len());
    if leftovers.is_empty() {
        return Ok(true);
    }

    warn!(count = leftovers.len(), "Messages could not be delivered");
    for message in &leftovers {
        println!("{}\t{}", message.routing_key, message.body);
    }
    Ok(false)
}

/// Returns false when any node is unusable
fn check(config: &PublisherConfig) -> Result<bool, Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let broker = AmqpBroker::new().with_connection_name("pid-connector check");
    let timeout = config.connector_settings().connection_timeout;

    let mut all_ok = true;
    for node in config.resolve_nodes()? {
        match runtime.block_on(check_connectivity(&broker, &node, timeout)) {
            Ok(()) => println!("{}\tOK", node.display_name()),
            Err(e) => {
                all_ok = false;
                println!("{}\tFAILED\t{}", node.display_name(), e);
            }
        }
    }
    Ok(all_ok)
}

fn handle_config_command(
    config: &PublisherConfig,
    show: bool,
) -> Result<bool, Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_documents_skips_blank_lines() {
        let input = Cursor::new("{\"handle\": \"21.T11148/a\"}\n\n{\"handle\": \"21.T11148/b\"}\n");
        let messages = read_documents(input, "handle.create").unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].routing_key, "handle.create");
        assert_eq!(messages[1].body["handle"], "21.T11148/b");
    }

    #[test]
    fn test_read_documents_reports_bad_line() {
        let input = Cursor::new("{\"ok\": true}\nnot json\n");
        let error = read_documents(input, "handle.create").unwrap_err();
        assert!(error.to_string().contains("line 2"));
    }

    #[test]
    fn test_cli_parses_publish() {
        let cli = Cli::try_parse_from(["pid-connector", "-vv", "publish", "--routing-key", "k"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Publish { ref routing_key, file: None } if routing_key == "k"));
    }
}
