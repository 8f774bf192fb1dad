use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use squelch_core::config::Config;
use squelch_core::core_channel::ChannelCatalog;
use squelch_core::core_directory::MemoryDirectory;
use squelch_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use squelch_core::ChannelId;

mod simulate;

use simulate::{run_simulation, SimulationOptions};

#[derive(Parser, Debug)]
#[command(name = "squelch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// TOML configuration file; defaults plus SQUELCH_* overrides otherwise
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the channels seeded into a fresh directory
    Channels,

    /// Inspect the effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run a push-to-talk exchange between in-process participants
    Simulate {
        /// Number of participants attached to the channel
        #[arg(short, long, default_value_t = 3)]
        participants: usize,

        /// Channel to attach to
        #[arg(long, default_value = "01")]
        channel: String,

        /// How long the first participant keeps transmitting
        #[arg(long, default_value = "500ms", value_parser = parse_duration)]
        talk: Duration,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the configuration as JSON
    Show,
    /// Check the configuration and exit
    Validate,
    /// Write the configuration to a TOML file
    Write { path: PathBuf },
}

fn parse_duration(raw: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(raw).map_err(|e| e.to_string())
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Config::from_env().context("Invalid SQUELCH_* environment overrides"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let mut log_config = LogConfig::from_section(&config.logging)?;
    if let Some(level) = &args.log_level {
        let level = LogLevel::from_str(level).unwrap_or_else(|_| {
            eprintln!("Invalid log level '{}', using 'info'", level);
            LogLevel::Info
        });
        log_config.level = level;
    }
    if args.json_logs {
        log_config = log_config.json_format(true);
    }
    init_logging_with_config(log_config)?;

    if config.metrics.enabled {
        squelch_core::metrics::init_metrics();
    }

    info!("Squelch CLI started");

    match args.command {
        Some(Command::Channels) => {
            let store = MemoryDirectory::new();
            let catalog = ChannelCatalog::new(Arc::new(store.connect()), config.channels.clone());
            catalog.ensure_defaults().await?;
            for channel in catalog.list().await? {
                println!("{}  {}", channel.id, channel.display_name());
            }
        }
        Some(Command::Config { action }) => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Validate => {
                config.validate()?;
                println!("Configuration is valid");
            }
            ConfigAction::Write { path } => {
                config.save_to_file(&path)?;
                println!("Wrote configuration to {}", path.display());
            }
        },
        Some(Command::Simulate {
            participants,
            channel,
            talk,
        }) => {
            let options = SimulationOptions {
                participants,
                channel: ChannelId::new(channel),
                talk,
            };
            let report = run_simulation(&config, options).await?;
            print!("{report}");
            if !report.delivered() {
                warn!(channel = %report.channel, "Transmission did not reach a bound listener");
            }
        }
        None => {
            info!("No command specified. Use --help for usage information.");
        }
    }

    info!("Squelch CLI finished");

    Ok(())
}
