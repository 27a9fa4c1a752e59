//! steadykv CLI.
//!
//! Runs one store operation against the redb backend under
//! `$STEADYKV_HOME/data` (default `~/.steadykv/data`).

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use steadykv::backend::RedbBackend;
use steadykv::config::ConfigFile;
use steadykv::store::{FileMarkers, Store};
use steadykv::{constants, paths};

mod commands;

#[derive(Parser)]
#[command(name = "steadykv", version, about = "Resilient key-value store")]
struct Cli {
    /// Home directory (default: $STEADYKV_HOME or ~/.steadykv)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Config file (default: <home>/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database name
    #[arg(short, long, global = true, default_value = constants::DEFAULT_DATABASE)]
    database: String,

    /// Collection name
    #[arg(short, long, global = true, default_value = constants::DEFAULT_COLLECTION)]
    collection: String,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read keys and print them as a JSON object (absent keys are null)
    Get {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Write KEY=JSON pairs in one transaction
    Set {
        #[arg(required = true, value_name = "KEY=JSON")]
        entries: Vec<String>,
    },
    /// Remove every entry of the collection
    Clear,
    /// Reload the collection and print every entry
    Dump,
    /// Print the store mode
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let home = match cli.home {
        Some(home) => home,
        None => paths::get_home_dir()?,
    };
    let config_path = cli
        .config
        .unwrap_or_else(|| paths::get_config_path(&home));
    let config = ConfigFile::load_or_default(&config_path)?.store;
    for warning in config.validate()?.warnings {
        warn!("{warning}");
    }

    let backend = Arc::new(RedbBackend::new(paths::get_data_dir(&home)));
    let markers = Arc::new(FileMarkers::new(paths::get_markers_path(&home)));
    let store = Store::builder(backend, cli.database, cli.collection)
        .config(config)
        .markers(markers)
        .on_error(|err| warn!(error = %err, "Storage backend failure"))
        .open()
        .await;

    let result = commands::execute(&store, cli.command).await;
    store.close().await;

    println!("{}", result?);
    Ok(())
}

/// Initialize logging to stderr, keeping stdout for command output.
///
/// `RUST_LOG` overrides the level picked by `--verbose`.
fn init_logging(verbose: bool, json: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
