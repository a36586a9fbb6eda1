mod daemon;
mod worker;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use askd_config::{AppConfig, resolve_runtime_dir};
use askd_core::{ClientRequest, default_client_id};
use askd_runtime::DaemonClient;

#[derive(Debug, Parser)]
#[command(
    name = "askd",
    version,
    about = "Per-client assistant sessions behind one local daemon",
    disable_help_subcommand = true
)]
struct Cli {
    /// Config file (TOML).  Missing files mean defaults.
    #[arg(long, global = true, env = "ASKD_CONFIG")]
    config: Option<PathBuf>,

    /// Session owner; defaults to user@host:parent-pid.
    #[arg(long, global = true, env = "ASKD_CLIENT_ID")]
    client_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the broker daemon in the foreground.
    Daemon,
    #[command(hide = true)]
    Worker(worker::WorkerArgs),
    /// Ask this client's assistant a question.
    Ask {
        #[arg(required = true, trailing_var_arg = true)]
        question: Vec<String>,
        /// Idempotency token; repeating it replays the earlier answer.
        #[arg(long)]
        request_id: Option<String>,
    },
    /// Show this client's session, or every session with --all.
    Status {
        #[arg(long)]
        all: bool,
    },
    /// Show settings, or set the profile (high, default, low).
    Config { profile: Option<String> },
    /// Include the reasoning trace in answers (on|off).
    Reasoning { state: String },
    /// on: final answer only; off: append run details.
    #[command(name = "output-format", visible_alias = "final-only")]
    OutputFormat { state: String },
    /// Stop this client's worker.
    Stop,
    /// Stop every worker and exit the daemon.
    Shutdown,
    /// Daemon uptime and worker summary.
    Health,
    /// List daemon commands.
    Help,
    /// Write a config file with every default filled in.
    Init {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(default_config_path);
    let config = match &config_path {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let client_id = cli
        .client_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(default_client_id);

    let request = match cli.command {
        Commands::Daemon => {
            daemon::run_daemon_process(config, config_path).await?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Worker(args) => {
            worker::run_worker_process(&config, args).await?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Init { force } => {
            let Some(path) = config_path else {
                bail!("no config path: pass --config or set HOME");
            };
            if path.exists() && !force {
                bail!("{} already exists; use --force to overwrite", path.display());
            }
            config.save_to(&path)?;
            println!("wrote {}", path.display());
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Ask {
            question,
            request_id,
        } => ClientRequest {
            question: Some(question.join(" ")),
            request_id,
            ..ClientRequest::for_client("ask", &client_id)
        },
        Commands::Status { all } if all => ClientRequest::new("status"),
        Commands::Status { .. } => ClientRequest::for_client("status", &client_id),
        Commands::Config { profile } => ClientRequest {
            profile,
            ..ClientRequest::for_client("config", &client_id)
        },
        Commands::Reasoning { state } => ClientRequest {
            state: Some(state),
            ..ClientRequest::for_client("reasoning", &client_id)
        },
        Commands::OutputFormat { state } => ClientRequest {
            state: Some(state),
            ..ClientRequest::for_client("output-format", &client_id)
        },
        Commands::Stop => ClientRequest::for_client("stop", &client_id),
        Commands::Shutdown => ClientRequest::new("shutdown"),
        Commands::Health => ClientRequest::new("health"),
        Commands::Help => ClientRequest::new("help"),
    };

    let runtime_dir = resolve_runtime_dir(config.runtime_dir_override().as_deref())?;
    let client = DaemonClient::new(config.daemon_socket(&runtime_dir)).with_reply_timeout(
        Duration::from_secs(config.daemon.worker_request_timeout_secs + 30),
    );

    match client.request(&request).await?.into_result() {
        Ok(Value::String(text)) => {
            println!("{text}");
            Ok(ExitCode::SUCCESS)
        }
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(error) => {
            eprintln!("error: {error}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(|home| PathBuf::from(home).join(".config").join("askd").join("config.toml"))
}
