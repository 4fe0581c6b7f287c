//! Serve remote objects through a local store, fetching each one on first access.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;

mod app_config;
mod session;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

#[derive(Parser)]
#[command(
    version,
    about = "A local store that fetches missing objects from a remote on demand."
)]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to an overlay-fs config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// What to do with the overlay.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print whether a path exists, fetching it if needed.
    Exists {
        /// Store path, such as `/a/b.txt`.
        path: String,
    },

    /// Fetch paths into the local store concurrently.
    Fetch {
        /// Store paths to fetch.
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Write the content of a path to stdout, fetching it if needed.
    Cat {
        /// Store path to print.
        path: String,
    },

    /// Send a local path to the remote.
    Push {
        /// Store path to send.
        path: String,
    },

    /// Remove stale files from the local store.
    Expire,
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let config = Config::load_or_default(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    if let Err(e) = Trc::default().init() {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    }

    if let Err(e) = session::spawn(config, args.command) {
        error!("{e}");
        std::process::exit(1);
    }
}
