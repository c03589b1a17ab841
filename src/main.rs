use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use gamesmith::config::ServeArgs;

mod cmd;

#[derive(Parser)]
#[command(name = "gamesmith")]
#[command(version, about = "Game spec factory: briefs in, deduplicated specs and code jobs out")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP/WebSocket server and the code job workers
    Serve(ServeArgs),
    /// Initialize the database only (don't start the server)
    InitDb {
        /// Database path
        #[arg(long, env = "DATABASE_PATH", default_value = ".gamesmith/gamesmith.db")]
        db_path: PathBuf,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f == "json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => cmd::cmd_serve(args.into_config()).await?,
        Commands::InitDb { db_path } => cmd::cmd_init_db(&db_path)?,
    }
    Ok(())
}
