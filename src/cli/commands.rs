//! CLI command definitions for stephub.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::info;

use crate::client::HubClient;
use crate::config::HubConfig;
use crate::protocol::DEFAULT_PORT;
use crate::scheduler::SchedulerConfig;
use crate::server;

/// Default sqlite database file for the hub.
const DEFAULT_DATABASE_URL: &str = "sqlite://stephub.db";

/// Default base directory for the blob store.
const DEFAULT_BLOB_PATH: &str = "./stephub-blobs";

/// Step-graph scheduling hub and client tooling.
#[derive(Parser)]
#[command(name = "stephub")]
#[command(about = "Distributed step-graph scheduling hub")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the hub server.
    Serve(ServeArgs),

    /// Print per-status step counts from a running hub.
    Status(ClientArgs),

    /// Fetch errored steps from a running hub.
    Errors(ErrorsArgs),

    /// Reset errored steps back to pending.
    ResetErrors(ResetErrorsArgs),

    /// Cancel a step and its connected component.
    Cancel(StepIdArgs),

    /// Revive a step and its connected component.
    Reset(StepIdArgs),

    /// Delete every step row on the hub.
    Delete(ClientArgs),
}

/// Arguments for `stephub serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Interface to bind the listener to.
    #[arg(long, env = "STEPHUB_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// TCP port of the hub listener.
    #[arg(long, env = "STEPHUB_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Sqlite connection string for the step store.
    #[arg(long, env = "STEPHUB_DATABASE_URL", default_value = DEFAULT_DATABASE_URL)]
    pub database_url: String,

    /// Base directory of the blob store.
    #[arg(long, env = "STEPHUB_BLOB_PATH", default_value = DEFAULT_BLOB_PATH)]
    pub blob_path: PathBuf,

    /// Per-request read timeout in seconds.
    #[arg(long, default_value = "30")]
    pub read_timeout: u64,

    /// Maximum ids returned per dispatch request.
    #[arg(long, default_value = "50")]
    pub dispatch_limit: usize,

    /// Seconds a working step may go silent before it is considered
    /// abandoned and re-dispatched.
    #[arg(long, default_value = "600")]
    pub staleness: u64,
}

/// Connection arguments shared by client subcommands.
#[derive(Parser, Debug)]
pub struct ClientArgs {
    /// Hub host to connect to.
    #[arg(long, env = "STEPHUB_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Hub port to connect to.
    #[arg(long, env = "STEPHUB_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

impl ClientArgs {
    fn client(&self) -> HubClient {
        HubClient::new(format!("{}:{}", self.host, self.port))
    }
}

/// Arguments for `stephub errors`.
#[derive(Parser, Debug)]
pub struct ErrorsArgs {
    #[command(flatten)]
    pub conn: ClientArgs,

    /// Maximum number of errored steps to fetch.
    #[arg(short = 'n', long, default_value = "50")]
    pub count: i64,

    /// Skip errors whose message contains this substring (repeatable).
    #[arg(long)]
    pub exclude: Vec<String>,
}

/// Arguments for `stephub reset-errors`.
#[derive(Parser, Debug)]
pub struct ResetErrorsArgs {
    #[command(flatten)]
    pub conn: ClientArgs,

    /// Also reset steps stuck in working.
    #[arg(long)]
    pub include_working: bool,
}

/// Arguments for subcommands that target one step.
#[derive(Parser, Debug)]
pub struct StepIdArgs {
    #[command(flatten)]
    pub conn: ClientArgs,

    /// Id of the step to act on.
    pub step_id: String,
}

/// Parses CLI arguments from the process environment.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the command carried by already-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Status(args) => {
            let counts = args.client().step_count(true).await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
            Ok(())
        }
        Commands::Errors(args) => {
            let report = args.conn.client().fetch_errors(args.count, &args.exclude).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::ResetErrors(args) => {
            args.conn.client().reset_errors(args.include_working).await?;
            info!("Reset request accepted");
            Ok(())
        }
        Commands::Cancel(args) => {
            args.conn.client().cancel(&args.step_id).await?;
            info!(step_id = %args.step_id, "Cancel request accepted");
            Ok(())
        }
        Commands::Reset(args) => {
            args.conn.client().reset(&args.step_id).await?;
            info!(step_id = %args.step_id, "Reset request accepted");
            Ok(())
        }
        Commands::Delete(args) => {
            args.client().delete_steps().await?;
            info!("Delete request accepted");
            Ok(())
        }
    }
}

/// Builds a [`HubConfig`] from serve arguments and runs the hub until
/// Ctrl-C.
async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = HubConfig::new()
        .with_host(args.host)
        .with_port(args.port)
        .with_database_url(args.database_url)
        .with_blob_path(args.blob_path)
        .with_read_timeout(Duration::from_secs(args.read_timeout))
        .with_scheduler(
            SchedulerConfig::default()
                .with_limit(args.dispatch_limit)
                .with_staleness(Duration::from_secs(args.staleness)),
        );

    let (shutdown_tx, _) = broadcast::channel(1);

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            let _ = signal_tx.send(());
        }
    });

    server::run(config, shutdown_tx).await?;
    Ok(())
}
