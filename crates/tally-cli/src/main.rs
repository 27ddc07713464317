//! Tally CLI - Point-of-sale from the command line
//!
//! Every command works offline against the local store; `sync` and `watch`
//! reconcile with the remote store when one is configured.

mod cli;
mod commands;
mod error;
#[cfg(test)]
mod tests;

use clap::Parser;

use crate::cli::{Cli, Commands, ProductCommands, SaleCommands, SyncCommands};
use crate::commands::common::resolve_config;
use crate::commands::completions::run_completions;
use crate::commands::product::{
    product_patch, run_product_add, run_product_delete, run_product_edit, run_product_list,
};
use crate::commands::sale::{run_sale_list, run_sale_record};
use crate::commands::sync::{run_sync, run_sync_conflicts, run_sync_status};
use crate::commands::watch::run_watch;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "tally=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Commands::Completions { shell, output } = &cli.command {
        return run_completions(*shell, output.as_deref());
    }
    let config = resolve_config(&cli)?;

    match cli.command {
        Commands::Product { command } => match command {
            ProductCommands::Add {
                name,
                price,
                stock,
                sku,
            } => run_product_add(&name, price, stock, sku, &config).await?,
            ProductCommands::List { limit, json } => run_product_list(limit, json, &config).await?,
            ProductCommands::Edit {
                id,
                name,
                price,
                stock,
                sku,
            } => {
                let patch = product_patch(name, price, stock, sku)?;
                run_product_edit(&id, patch, &config).await?;
            }
            ProductCommands::Delete { id } => run_product_delete(&id, &config).await?,
        },
        Commands::Sale { command } => match command {
            SaleCommands::Record {
                items,
                payment,
                note,
            } => run_sale_record(&items, payment.into(), note, &config).await?,
            SaleCommands::List { limit, json } => run_sale_list(limit, json, &config).await?,
        },
        Commands::Sync { command } => match command {
            None => run_sync(false, &config).await?,
            Some(SyncCommands::Full) => run_sync(true, &config).await?,
            Some(SyncCommands::Status { json }) => run_sync_status(json, &config).await?,
            Some(SyncCommands::Conflicts { limit, json }) => {
                run_sync_conflicts(limit, json, &config).await?;
            }
        },
        Commands::Watch { json } => run_watch(json, &config).await?,
        Commands::Completions { .. } => {}
    }

    Ok(())
}
