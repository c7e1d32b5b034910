//! EISLab CLI: terminal front end for impedance-spectroscopy analysis.
//!
//! Loads sweep and map CSV files, runs the AI analysis with an optional
//! follow-up REPL, saves runs to history, and prints heatmap and calibration
//! views.

mod commands;
mod repl;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// EISLab: impedance sweeps and maps, interpreted
#[derive(Parser, Debug)]
#[command(name = "eislab", version, about, long_about = None)]
struct Cli {
    /// Model to use for analysis
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Workspace directory (looks for .eislab/config.toml)
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Analyze a sweep or map CSV file
    Analyze {
        /// CSV file with frequency, magnitude and phase columns
        file: PathBuf,

        /// Treat the file as a 2D map (requires x and y columns)
        #[arg(long)]
        map: bool,

        /// Subject the reading belongs to; enables historical context
        #[arg(short, long)]
        subject: Option<String>,

        /// Analysis topic: general, soil, plant (defaults by dataset type; maps accept soil only)
        #[arg(short, long)]
        topic: Option<String>,

        /// Calibration coefficients file (.json or .toml)
        #[arg(short, long)]
        calibration: Option<PathBuf>,

        /// Save the run to history when done (requires --subject)
        #[arg(long)]
        save: bool,

        /// Ask follow-up questions after the initial analysis
        #[arg(short, long)]
        interactive: bool,
    },
    /// List saved runs, newest first
    History {
        /// Only runs for this subject
        #[arg(short, long)]
        subject: Option<String>,

        /// Maximum number of runs to show
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,

        /// Print runs as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the normalized heatmap layer of a map file
    Heatmap {
        /// Map CSV file with x, y, frequency, magnitude and phase columns
        file: PathBuf,

        /// Frequency layer to show (defaults to the lowest available)
        #[arg(short, long)]
        frequency: Option<f64>,

        /// Colour metric: magnitude or phase
        #[arg(long, default_value = "magnitude")]
        metric: String,

        /// Calibration coefficients file (.json or .toml)
        #[arg(short, long)]
        calibration: Option<PathBuf>,

        /// Print the mapping as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show calibration coefficients and the correction they apply
    Calibration {
        /// Coefficients file (.json or .toml); defaults to the configured set
        file: Option<PathBuf>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create default configuration file
    Init,
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "eislab", "eislab")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "eislab.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let mut config = eislab_core::config::load_config(Some(&workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    if let Some(model) = &cli.model {
        config.llm.model = model.clone();
    }
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    commands::handle_command(cli.command, config, &workspace).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_analyze_flags() {
        let cli = Cli::try_parse_from([
            "eislab",
            "analyze",
            "field.csv",
            "--map",
            "-s",
            "bed-3",
            "--save",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Analyze {
                file,
                map,
                subject,
                save,
                interactive,
                ..
            } => {
                assert_eq!(file, PathBuf::from("field.csv"));
                assert!(map);
                assert_eq!(subject.as_deref(), Some("bed-3"));
                assert!(save);
                assert!(!interactive);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_history_defaults() {
        let cli = Cli::try_parse_from(["eislab", "history"]).unwrap();
        match cli.command {
            Commands::History {
                subject,
                limit,
                json,
            } => {
                assert!(subject.is_none());
                assert_eq!(limit, 10);
                assert!(!json);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["eislab"]).is_err());
    }
}
