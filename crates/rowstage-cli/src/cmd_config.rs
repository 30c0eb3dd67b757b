use clap::Subcommand;
use rowstage_store::config::{parse_value_for, read_config, write_config};
use rowstage_store::StorePaths;

// ── CLI Schema ──

#[derive(Subcommand)]
pub enum ConfigCmd {
    /// Set a config value
    Set {
        /// Config key (e.g. base_url, protected_branch)
        key: String,
        /// Config value (true/false/number/string)
        value: String,
    },
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },
    /// Remove a config value
    Unset {
        /// Config key
        key: String,
    },
    /// List all config values
    List,
}

// ── Dispatch ──

pub fn run(cmd: ConfigCmd, store: &StorePaths) -> anyhow::Result<()> {
    match cmd {
        ConfigCmd::Set { key, value } => set(store, &key, &value),
        ConfigCmd::Get { key } => get(store, &key),
        ConfigCmd::Unset { key } => unset(store, &key),
        ConfigCmd::List => list(store),
    }
}

// ── Command Implementations ──

/// `rowstage config set <key> <value>`
pub fn set(store: &StorePaths, key: &str, value: &str) -> anyhow::Result<()> {
    store.ensure_layout()?;
    let mut config = read_config(&store.config_json)?;
    config.insert(key.to_string(), parse_value_for(key, value));
    write_config(&store.config_json, &config)?;
    println!("{key} = {value}");
    Ok(())
}

/// `rowstage config get <key>`
pub fn get(store: &StorePaths, key: &str) -> anyhow::Result<()> {
    let config = read_config(&store.config_json)?;
    match config.get(key) {
        Some(val) => println!("{val}"),
        None => println!("(not set)"),
    }
    Ok(())
}

/// `rowstage config unset <key>`
pub fn unset(store: &StorePaths, key: &str) -> anyhow::Result<()> {
    let mut config = read_config(&store.config_json)?;
    if config.remove(key).is_some() {
        write_config(&store.config_json, &config)?;
        println!("{key} removed");
    } else {
        println!("(not set)");
    }
    Ok(())
}

/// `rowstage config list`
pub fn list(store: &StorePaths) -> anyhow::Result<()> {
    let config = read_config(&store.config_json)?;
    if config.is_empty() {
        println!("(no config set)");
    } else {
        for (k, v) in &config {
            println!("{k} = {v}");
        }
    }
    Ok(())
}
