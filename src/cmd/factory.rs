use std::path::Path;

use anyhow::{Context, Result};

use gamesmith::config::AppConfig;
use gamesmith::factory::{db::FactoryDb, server};

pub async fn cmd_serve(config: AppConfig) -> Result<()> {
    tracing::info!(
        port = config.port,
        db_path = %config.db_path.display(),
        dev_mode = config.dev_mode,
        git_configured = config.git.is_configured(),
        "Starting gamesmith"
    );
    server::start_server(config).await
}

/// Create the database and schema without starting the server.
pub fn cmd_init_db(db_path: &Path) -> Result<()> {
    FactoryDb::new(db_path)
        .with_context(|| format!("Failed to initialize database at {}", db_path.display()))?;
    println!("Database initialized at {}", db_path.display());
    Ok(())
}
