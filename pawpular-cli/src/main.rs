//! pawpular CLI: train, validate and manage Pawpularity experiments.

mod commands;

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// pawpular: config-driven k-fold training for Pawpularity regression
#[derive(Parser, Debug)]
#[command(name = "pawpular", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (holds pawpular.toml and the git checkout)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path (replaces the workspace pawpular.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Trailing `key.path=value` configuration overrides.
#[derive(clap::Args, Debug, Clone, Default)]
struct Overrides {
    /// Overrides such as `params.epoch=5 settings.debug=true`
    #[arg(value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train every fold, write OOF predictions and a submission
    Train {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Score a blend of earlier runs' out-of-fold predictions
    Validate {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Print the flattened training parameters and log them to MLflow when enabled
    Params {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Record a leaderboard score in a W&B run summary
    UpdateLb {
        /// Run path, `entity/project/run_id`
        #[arg(short, long)]
        run_path: String,
        /// Leaderboard score
        #[arg(short, long)]
        score: f64,
    },
    /// Delete a registered MLflow model and all of its versions
    DeleteModel {
        /// Registered model name
        name: String,
    },
    /// Send a message to the configured Slack webhook
    Notify {
        /// Message text
        text: String,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default pawpular.toml into the workspace
    Init,
    /// Show the resolved configuration
    Show {
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Paths shared by every command.
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub workspace: PathBuf,
    pub config_file: Option<PathBuf>,
    /// Output directory for commands that produce run artifacts.
    pub run_dir: Option<PathBuf>,
}

fn init_tracing(verbose: u8, quiet: bool, log_dir: &Path, file_name: &str) -> Option<WorkerGuard> {
    let filter = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| filter.to_string());

    // Human-readable layer for stderr (always active)
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(&filter));

    // JSON file layer; skipped when the directory cannot be created
    if std::fs::create_dir_all(log_dir).is_err() {
        tracing_subscriber::registry().with(stderr_layer).init();
        return None;
    }
    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    Some(guard)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    // Commands that write artifacts log into their run directory
    let run_dir = match &cli.command {
        Commands::Train { overrides } | Commands::Validate { overrides } => {
            let config = commands::load(&workspace, cli.config.as_deref(), &overrides.overrides)?;
            Some(config.run_dir(chrono::Local::now()))
        }
        _ => None,
    };
    let log_dir = run_dir.clone().unwrap_or_else(|| {
        directories::ProjectDirs::from("dev", "pawpular", "pawpular")
            .map(|d| d.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("."))
    });
    let _guard = init_tracing(cli.verbose, cli.quiet, &log_dir, commands::LOG_FILE);

    let invocation = Invocation {
        workspace,
        config_file: cli.config,
        run_dir,
    };
    commands::handle_command(cli.command, &invocation).await
}
