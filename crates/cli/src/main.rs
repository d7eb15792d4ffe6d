//! Nexis CLI - Main Entry Point
//!
//! Deploys and manages confidential VMs through the Nexis cloud API.

use clap::{Parser, Subcommand};

mod commands;
mod output;

use commands::{cvm, deploy, keys, watch, CloudArgs};
use nexis_common::CvmAction;

/// Nexis CLI - confidential VMs on Nexis Cloud
#[derive(Parser)]
#[command(name = "nexis")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    cloud: CloudArgs,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an X25519 key pair
    Keygen(keys::KeygenArgs),

    /// Encrypt environment variables for a CVM public key
    EncryptEnv(keys::EncryptEnvArgs),

    /// List nodes available for deployment
    Nodes,

    /// List instance types
    InstanceTypes,

    /// List CVMs
    List {
        #[arg(long, default_value = "1")]
        page: u64,

        #[arg(long, default_value = "20")]
        page_size: u64,
    },

    /// Show CVM details
    Show {
        /// CVM id (app id, instance id or bare 40-hex app id)
        id: String,
    },

    /// Print the SSH command for a CVM
    Ssh { id: String },

    /// Provision and create a CVM from a compose file
    Deploy(deploy::DeployArgs),

    /// Stream state changes until Ctrl-C
    Watch { id: String },

    /// Start a CVM
    Start { id: String },

    /// Stop a CVM
    Stop { id: String },

    /// Restart a CVM
    Restart { id: String },

    /// Delete a CVM
    Delete { id: String },

    /// Set public log and sysinfo visibility
    Visibility {
        id: String,

        #[arg(long)]
        public_logs: Option<bool>,

        #[arg(long)]
        public_sysinfo: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let format = cli.format;
    match cli.command {
        Commands::Keygen(args) => keys::keygen(args, format).await?,
        Commands::EncryptEnv(args) => keys::encrypt(args, format).await?,
        Commands::Nodes => cvm::nodes(&cli.cloud.client()?, format).await?,
        Commands::InstanceTypes => cvm::instance_types(&cli.cloud.client()?, format).await?,
        Commands::List { page, page_size } => cvm::list(&cli.cloud.client()?, page, page_size, format).await?,
        Commands::Show { id } => cvm::show(&cli.cloud.client()?, &id, format).await?,
        Commands::Ssh { id } => cvm::ssh(&cli.cloud.client()?, &id, format).await?,
        Commands::Deploy(args) => deploy::execute(args, &cli.cloud.client()?, format).await?,
        Commands::Watch { id } => watch::execute(&cli.cloud.client()?, &id, format).await?,
        Commands::Start { id } => cvm::action(&cli.cloud.client()?, &id, CvmAction::Start).await?,
        Commands::Stop { id } => cvm::action(&cli.cloud.client()?, &id, CvmAction::Stop).await?,
        Commands::Restart { id } => cvm::action(&cli.cloud.client()?, &id, CvmAction::Restart).await?,
        Commands::Delete { id } => cvm::delete(&cli.cloud.client()?, &id).await?,
        Commands::Visibility {
            id,
            public_logs,
            public_sysinfo,
        } => cvm::visibility(&cli.cloud.client()?, &id, public_logs, public_sysinfo, format).await?,
    }

    Ok(())
}
