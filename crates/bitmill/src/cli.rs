//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bitmill_service::config::Config;
use bitmill_service::{logging, metrics};
use clap::{Parser, Subcommand};

use crate::cleanup;
use crate::load::{self, LoadArgs};

/// Bitmill commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Load images through the engine and report where they came from.
    Load(LoadArgs),

    /// Report the size of the disk cache and clear it.
    Cleanup {
        /// Only report the size, keep all entries.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Command line interface parser.
#[derive(Parser, Debug)]
#[command(name = "bitmill", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// The name of this host, if it is needed for the metrics.
fn metrics_hostname(config: &Config) -> Option<String> {
    config.metrics.hostname_tag.as_ref()?;
    hostname::get().ok()?.into_string().ok()
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: No other threads have been spawned yet.
    unsafe { logging::init_logging(&config) };

    let hostname = metrics_hostname(&config);
    metrics::configure_statsd(&config.metrics, hostname.as_deref())
        .context("failed to configure statsd")?;

    match cli.command {
        Command::Load(args) => load::run(config, args).context("failed to load images")?,
        Command::Cleanup { dry_run } => {
            cleanup::run(&config, dry_run).context("failed to clean up the disk cache")?;
        }
    }

    Ok(())
}
