use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::info;

use sharedstore::cli::{Cli, Command};
use sharedstore::config::Config;
use sharedstore::{FileStore, SharedStore};

fn setup_logging() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let store_path = cli.store.unwrap_or(config.store_path);

    info!("sharedstore starting at {}", store_path.display());
    let store = FileStore::open(&store_path).context("Failed to open store")?;

    match cli.command {
        Command::List { prefix } => {
            let namespace = prefix.map(|p| format!("{p}."));
            let keys: Vec<_> = store
                .keys()?
                .into_iter()
                .filter(|k| namespace.as_ref().is_none_or(|ns| k.starts_with(ns)))
                .collect();
            if keys.is_empty() {
                println!("No keys found");
            } else {
                for key in keys {
                    println!("{}", key);
                }
            }
        }
        Command::Get { key } => {
            let value = store.get(&key)?.ok_or_else(|| eyre!("No such key: {}", key))?;
            println!("{}", value);
        }
        Command::Set { key, value } => {
            store.set(&key, &value)?;
            println!("{} Set {}", "✓".green(), key.cyan());
        }
        Command::Rm { key } => {
            store.remove(&key)?;
            println!("{} Removed {}", "✓".green(), key);
        }
    }

    Ok(())
}
