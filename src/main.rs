// ===================================================================================================
// Billmesh - Usage-Based Subscription Billing Engine
// ===================================================================================================
//
// Binary entry point. Wires configuration, logging, the SQLite store, the in-process
// analytics and payment provider implementations, and the five scheduler loops that advance
// subscriptions through their billing lifecycle.
//
// ===================================================================================================

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use billmesh::analytics::InMemoryAnalytics;
use billmesh::cli::{Cli, Commands};
use billmesh::config::Config;
use billmesh::database::DatabaseManager;
use billmesh::engine::BillingEngine;
use billmesh::logging;
use billmesh::payment_provider::MockPaymentProvider;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging_safe();

    let mut config = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load_or_default(),
    };

    match cli.command {
        Commands::Config { init } => {
            if init {
                let path = Config::default_config_path()
                    .ok_or_else(|| anyhow::anyhow!("no config directory available"))?;
                config.save_to_file(&path)?;
                println!("wrote {}", path.display());
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Serve { dev, db_path } => {
            if dev {
                config.schedulers.tick_interval_secs = 300;
            }
            if let Some(path) = db_path {
                config.database.db_path = Some(path);
            }

            let db = Arc::new(DatabaseManager::new(&config.database_path())?);
            let analytics = Arc::new(InMemoryAnalytics::new());
            let provider = Arc::new(MockPaymentProvider::new());
            let tick = config.tick_interval();
            let engine = BillingEngine::new(config, db, analytics, provider);

            let schedulers = engine.scheduler_set();
            let handles = schedulers.start(tick);
            info!("billmesh serving; press ctrl-c to stop");

            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            for handle in handles {
                handle.abort();
            }
        }
    }
    Ok(())
}
