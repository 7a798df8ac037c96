mod devices;
mod listen;
mod report;

use std::io::stderr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen to the GCN feed and trigger follow-up of accepted alerts.
    ///
    /// Devices are simulated; every command is logged. While running, type `abort` to abort
    /// the running trigger after its current exposure, `status` to show the listener state,
    /// and `stop` (or close stdin) to exit.
    Listen {
        /// Configuration file (JSON).
        #[arg(short, long, value_name = "path")]
        config: PathBuf,

        /// Make simulated exposures take their requested exposure time.
        #[arg(long, action)]
        realtime: bool,
    },
    /// Evaluate an alert file against the observability criteria without triggering.
    Evaluate {
        #[arg(short, long, value_name = "path")]
        config: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: report::Format,

        /// VOEvent XML file.
        input: PathBuf,
    },
    /// Show the current observability of a position.
    ///
    /// Coordinates may be decimal degrees or sexagesimal, e.g., 18:26:51.4 -08:55:23.
    Target {
        #[arg(short, long, value_name = "path")]
        config: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: report::Format,

        /// Right ascension (J2000).
        #[arg(allow_hyphen_values = true)]
        ra: String,

        /// Declination (J2000).
        #[arg(allow_hyphen_values = true)]
        dec: String,
    },
    /// Validate and show an exposure plan.
    Plan {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: report::Format,

        /// Exposure plan file (JSON).
        path: PathBuf,
    },
    /// Archive an alert file as raw XML and HTML.
    Archive {
        #[arg(short, long, value_name = "path")]
        config: PathBuf,

        /// VOEvent XML file.
        input: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(stderr)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_env("GRBTOO_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    debug!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Listen { config, realtime } => listen::listen(config, *realtime),
        Commands::Evaluate {
            config,
            format,
            input,
        } => report::evaluate(config, input, format),
        Commands::Target {
            config,
            format,
            ra,
            dec,
        } => report::target(config, ra, dec, format),
        Commands::Plan { format, path } => report::plan(path, format),
        Commands::Archive { config, input } => report::archive(config, input),
    }
}
