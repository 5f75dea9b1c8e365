mod commands;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

use commands::remote::{ExecutionArgs, SubmitArgs, WatchArgs};
use commands::run::RunArgs;
use commands::validate::ValidateArgs;
use etoad_rpc::{EtoadRpcClient, DEFAULT_ENDPOINT};
use etoad_service::ServiceConfig;

/// etoad - run and control electrochemical measurement protocols
#[derive(Parser, Debug)]
#[command(name = "etoad")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run and control measurement protocols locally or over gRPC", long_about = None)]
struct Cli {
    /// Configuration file (default: etoad.toml when present)
    #[arg(global = true, long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Server endpoint for remote commands
    #[arg(global = true, long, default_value = DEFAULT_ENDPOINT, env = "ETOAD_ENDPOINT")]
    endpoint: String,

    /// Enable debug logging
    #[arg(global = true, long, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the gRPC server
    Serve,

    /// Run a protocol locally against the simulated capability
    Run(RunArgs),

    /// Validate a protocol file
    Validate(ValidateArgs),

    /// Submit a job file to the server
    Submit(SubmitArgs),

    /// Show the current status of an execution
    Status(ExecutionArgs),

    /// Follow status updates or intermediate payloads until the job finishes
    Watch(WatchArgs),

    /// Print the termination message of a finished execution
    Result(ExecutionArgs),

    /// Request cancellation of an execution
    Cancel(ExecutionArgs),

    /// List executions known to the server
    List,
}

fn init_logging(config: &ServiceConfig, verbose: bool) {
    let fallback = if verbose { "debug" } else { config.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let config = ServiceConfig::load(cli.config.as_deref())?;
    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Serve => etoad_service::server::serve(&config).await?,
        Commands::Run(args) => commands::run::execute(args, &config).await?,
        Commands::Validate(args) => commands::validate::execute(args)?,
        remote => {
            let mut client = EtoadRpcClient::connect(cli.endpoint).await?;
            match remote {
                Commands::Submit(args) => commands::remote::submit(&mut client, args).await?,
                Commands::Status(args) => commands::remote::status(&mut client, args).await?,
                Commands::Watch(args) => commands::remote::watch(&mut client, args).await?,
                Commands::Result(args) => commands::remote::result(&mut client, args).await?,
                Commands::Cancel(args) => commands::remote::cancel(&mut client, args).await?,
                Commands::List => commands::remote::list(&mut client).await?,
                Commands::Serve | Commands::Run(_) | Commands::Validate(_) => {}
            }
        }
    }

    Ok(())
}
