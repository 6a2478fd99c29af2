//! slotsched CLI
//!
//! Validates cluster scenarios, simulates scheduling passes over them and runs
//! the scheduling loop on an interval.

mod commands;

use clap::{Parser, Subcommand};
use slotsched_core::{DaemonConfig, LoggingConfig};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::FmtSubscriber;

/// slotsched - session scheduler for compute clusters
#[derive(Parser, Debug)]
#[command(name = "slotsched")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (overrides the config file)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check a scenario file and its scheduler settings
    Validate {
        /// Scenario file (TOML)
        scenario: PathBuf,
    },

    /// Run scheduling passes over a scenario and print the decisions
    Simulate {
        /// Scenario file (TOML)
        scenario: PathBuf,

        /// Number of passes
        #[arg(long, default_value_t = 1)]
        ticks: u64,

        /// Print decisions as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the scheduling loop until interrupted
    Run {
        /// Scenario file (TOML)
        scenario: PathBuf,

        /// Daemon configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn init_logging(config: &LoggingConfig, cli: &Cli) -> anyhow::Result<()> {
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        parse_level(cli.log_level.as_deref().unwrap_or(&config.level))
    };

    let (writer, ansi) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(writer);
    if config.format == "json" {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let daemon_config = match &cli.command {
        Commands::Run {
            config: Some(path), ..
        } => DaemonConfig::from_file(path)?,
        Commands::Run { .. } => DaemonConfig::default(),
        _ => DaemonConfig {
            logging: LoggingConfig {
                level: "warn".to_string(),
                ..Default::default()
            },
            ..Default::default()
        },
    };
    init_logging(&daemon_config.logging, &cli)?;

    match cli.command {
        Commands::Validate { scenario } => {
            commands::validate(&scenario)?;
        }
        Commands::Simulate {
            scenario,
            ticks,
            json,
        } => {
            commands::simulate(&scenario, ticks, json).await?;
        }
        Commands::Run { scenario, .. } => {
            commands::run(&scenario, &daemon_config).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_reports_second_install() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from(["slotsched", "validate", "scenario.toml"]);
        let config = LoggingConfig {
            file: Some(dir.path().join("slotsched.log")),
            ..Default::default()
        };

        init_logging(&config, &cli).unwrap();
        assert!(dir.path().join("slotsched.log").exists());
        assert!(init_logging(&config, &cli).is_err());
    }
}
