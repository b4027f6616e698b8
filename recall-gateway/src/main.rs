//! Recall Gateway - Main entry point.

use anyhow::Result;
use clap::{Parser, Subcommand};
use recall_common::{init_logging, Config};
use recall_gateway::UserStore;
use std::path::PathBuf;

/// Memory-backed chat gateway.
#[derive(Parser, Debug)]
#[command(name = "recall-gateway")]
#[command(version)]
#[command(about = "Chat gateway with a persistent memory peer per user.", long_about = None)]
struct Cli {
    /// Path to the JSON config file (defaults to the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP gateway (default)
    Serve,
    /// Create a user account
    AddUser {
        #[arg(long)]
        username: String,

        #[arg(long)]
        password: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_with_env(cli.config.as_deref())?;
    init_logging(&config.observability);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            tracing::info!("Recall Gateway v{}", env!("CARGO_PKG_VERSION"));
            recall_gateway::start_server(&config).await
        }
        Commands::AddUser { username, password } => {
            let store = UserStore::new(&config.database.resolved_path())?;
            let user = store.create(&username, &password)?;
            println!("Created user '{}' ({})", user.username, user.id);
            Ok(())
        }
    }
}
