//! simfleet CLI - distributed UI test runner for Apple simulators.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer};

use simfleet::channel::SystemChannels;
use simfleet::collaborator::Collaborators;
use simfleet::config::{self, Concurrency, Config, RunMode};
use simfleet::orchestrator::{self, Orchestrator};
use simfleet::report::ConsoleReporter;

const LOG_FILE: &str = "execution.log";

#[derive(Parser)]
#[command(name = "simfleet")]
#[command(about = "Distributed UI test runner for Apple simulators", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "simfleet.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Run {
        /// Retry failed tests this many times
        #[arg(long, conflicts_with = "stability")]
        retries: Option<usize>,

        /// Run every test this many times
        #[arg(long)]
        stability: Option<usize>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,

        /// Directory receiving the session artifacts
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Discover tests without running them
    Collect {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Validate configuration file
    Validate,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            retries,
            stability,
            junit,
            output_dir,
        } => {
            run_tests(
                &cli.config,
                Overrides {
                    retries,
                    stability,
                    junit,
                    output_dir,
                },
                cli.verbose,
            )
            .await
        }
        Commands::Collect { format } => {
            init_logging(cli.verbose, None)?;
            collect_tests(&cli.config, format).await
        }
        Commands::Validate => {
            init_logging(cli.verbose, None)?;
            validate_config(&cli.config)
        }
    }
}

/// Sets up stderr logging and, when given, the session log file.
///
/// `RUST_LOG` selects the level unless `--verbose` forces debug.
fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let filter = || {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        }
    };

    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter());

    let file = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(filter()),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr)
        .with(file)
        .try_init()?;
    Ok(())
}

struct Overrides {
    retries: Option<usize>,
    stability: Option<usize>,
    junit: Option<PathBuf>,
    output_dir: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, config: &mut Config) -> Result<()> {
        if let Some(retries) = self.retries {
            config.simfleet.retry_count = Some(retries);
            config.simfleet.stability_repeats = None;
        }
        if let Some(repeats) = self.stability {
            config.simfleet.stability_repeats = Some(repeats);
            config.simfleet.retry_count = None;
        }
        if let Some(dir) = self.output_dir {
            config.report.output_dir = dir;
        }
        if let Some(path) = self.junit {
            config.report.junit = true;
            config.report.junit_file = std::path::absolute(&path)?
                .to_string_lossy()
                .to_string();
        }
        config.validate()?;
        Ok(())
    }
}

async fn run_tests(config_path: &Path, overrides: Overrides, verbose: bool) -> Result<()> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    overrides.apply(&mut config).context("Invalid command line overrides")?;

    let log_path = config.report.output_dir.join(LOG_FILE);
    init_logging(verbose, Some(&log_path))?;
    info!("Loaded configuration from {}", config_path.display());

    let orchestrator = Orchestrator::new(config, SystemChannels, ConsoleReporter::new(verbose));
    let report = orchestrator
        .run()
        .await
        .with_context(|| format!("Session failed, see {}", log_path.display()))?;

    std::process::exit(report.exit_code());
}

async fn collect_tests(config_path: &Path, format: Format) -> Result<()> {
    let config = config::load_config(config_path)?;
    let collaborators = Collaborators::new(config.collaborators.clone());
    let tests = orchestrator::discover_tests(&config, &collaborators).await?;

    match format {
        Format::Json => {
            let json = serde_json::to_string_pretty(&tests)?;
            println!("{}", json);
        }
        Format::Text => {
            println!("Discovered {} tests:", tests.len());
            for test in &tests {
                let tags = if test.tags.is_empty() {
                    String::new()
                } else {
                    format!(
                        " [{}]",
                        test.tags.iter().cloned().collect::<Vec<_>>().join(", ")
                    )
                };
                println!("  {}{}", test.identifier(), tags);
            }
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            match config.simfleet.run_mode()? {
                RunMode::Retry { retries } => println!("  Mode: retry ({} retries)", retries),
                RunMode::Stability { repeats } => {
                    println!("  Mode: stability ({} repeats)", repeats)
                }
            }
            println!("  Infra retries: {}", config.simfleet.infra_retries);
            println!("  Idle timeout: {}s", config.simfleet.idle_timeout_secs);
            println!(
                "  Device: {} ({} {})",
                config.device.name, config.device.platform, config.device.runtime
            );
            println!("  Nodes:");
            for node in &config.nodes {
                let concurrency = match node.concurrency {
                    Concurrency::Fixed(n) => n.to_string(),
                    Concurrency::Auto => "auto".to_string(),
                };
                let kind = if node.is_local() { "local" } else { "ssh" };
                println!(
                    "    {} ({}, {}): {} runners",
                    node.name, kind, node.address, concurrency
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}
