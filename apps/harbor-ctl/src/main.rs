//! # harbor-ctl
//!
//! Operator CLI for the branch sync queue, and a standalone runner for the
//! sync agent on headless branch servers.

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use harbor_sync::{Operator, SyncConfig};

use crate::cli::{Cli, Commands};
use crate::commands::Output;

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "debug,sqlx=warn"
    } else {
        "info,harbor=debug,sqlx=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = SyncConfig::load(cli.config.clone())?;
    let db = commands::open_database(&config).await?;
    let operator = Operator::new(db.queue());
    let out = Output { json: cli.json };

    match cli.command {
        Commands::List {
            partition,
            entity_type,
            states,
            limit,
        } => commands::list(&operator, out, partition, entity_type, states, limit).await,
        Commands::Show { id } => commands::show(&operator, out, id).await,
        Commands::Retry { id } => commands::retry(&operator, out, id).await,
        Commands::Skip { id, reason } => commands::skip(&operator, out, id, &reason).await,
        Commands::Summary => commands::summary(&operator, out).await,
        Commands::Reap { stale_after_secs } => {
            let stale_after = stale_after_secs
                .map(|secs| chrono::Duration::seconds(secs as i64))
                .unwrap_or_else(|| config.retention.stale_after());
            commands::reap(&operator, out, stale_after).await
        }
        Commands::Purge { older_than_days } => {
            let older_than = older_than_days
                .map(|days| chrono::Duration::days(days as i64))
                .unwrap_or_else(|| config.retention.purge_after());
            commands::purge(&db, &operator, out, older_than).await
        }
        Commands::Run => commands::run(config, db).await,
    }
}
