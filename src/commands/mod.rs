//! CLI command implementations for steadykv.
//!
//! Each command runs against an opened [`Store`] and returns the text to
//! print:
//!
//! - `get KEY...` - JSON object of the requested keys
//! - `set KEY=JSON...` - one atomic write
//! - `clear` - remove every entry
//! - `dump` - refresh the cache from the backend and print it
//! - `status` - database, collection and mode

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::Command;
use steadykv::Store;

/// Execute a CLI command.
pub async fn execute(store: &Store, command: Command) -> Result<String> {
    match command {
        Command::Get { keys } => get(store, keys).await,
        Command::Set { entries } => set(store, &entries).await,
        Command::Clear => {
            store.clear().await.context("Failed to clear store")?;
            Ok(format!("Cleared {}/{}", store.database(), store.collection()))
        },
        Command::Dump => dump(store).await,
        Command::Status => Ok(status(store)),
    }
}

async fn get(store: &Store, keys: Vec<String>) -> Result<String> {
    let values = store.get_many(keys).await.context("Failed to read keys")?;
    let sorted: BTreeMap<String, Value> = values
        .into_iter()
        .map(|(key, value)| (key, value.unwrap_or(Value::Null)))
        .collect();
    Ok(serde_json::to_string_pretty(&sorted)?)
}

async fn set(store: &Store, raw: &[String]) -> Result<String> {
    let entries = raw
        .iter()
        .map(|entry| parse_entry(entry))
        .collect::<Result<Vec<_>>>()?;
    let count = entries.len();

    store.set_many(entries).await.context("Failed to write entries")?;
    Ok(format!(
        "Stored {count} {} in {}/{}",
        if count == 1 { "entry" } else { "entries" },
        store.database(),
        store.collection()
    ))
}

async fn dump(store: &Store) -> Result<String> {
    store.refresh().await.context("Failed to reload store")?;
    Ok(serde_json::to_string_pretty(&store.cached_entries())?)
}

fn status(store: &Store) -> String {
    format!(
        "database:   {}\ncollection: {}\nmode:       {}",
        store.database(),
        store.collection(),
        store.mode()
    )
}

/// Parse a `KEY=JSON` argument.
fn parse_entry(raw: &str) -> Result<(String, Value)> {
    let (key, json) = raw
        .split_once('=')
        .with_context(|| format!("Invalid entry '{raw}': expected KEY=JSON"))?;
    if key.is_empty() {
        anyhow::bail!("Invalid entry '{raw}': key cannot be empty");
    }

    let value = serde_json::from_str(json).with_context(|| {
        format!("Invalid JSON for key '{key}': {json}\n  Quote strings: {key}='\"text\"'")
    })?;
    Ok((key.to_string(), value))
}
