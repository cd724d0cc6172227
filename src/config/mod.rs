//! Configuration module for the database proxy.
//!
//! This module provides configuration parsing, validation, and management
//! for the listeners, backend pools, write batcher, and query cache.

use arc_swap::ArcSwap;
use log::info;
use once_cell::sync::Lazy;
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::errors::Error;

// Sub-modules
mod address;
mod batch;
mod cache;
mod general;
mod pool;
mod prometheus;

#[cfg(test)]
mod tests;

// Re-exports
pub use address::Address;
pub use batch::Batch;
pub use cache::Cache;
pub use general::General;
pub use pool::{Databases, Pool};
pub use prometheus::Prometheus;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Globally available configuration.
static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Configuration wrapper.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    // Serializer maintains the order of fields in the struct
    // so we should always put simple fields before nested fields
    // in all serializable structs to avoid ValueAfterTable errors.
    #[serde(
        default = "Config::default_path",
        skip_serializing_if = "String::is_empty"
    )]
    pub path: String,

    // General and global settings.
    #[serde(default)]
    pub general: General,

    // Prometheus settings.
    #[serde(default = "Prometheus::empty")]
    pub prometheus: Prometheus,

    // Query cache settings.
    #[serde(default)]
    pub cache: Cache,

    // Write batcher settings.
    #[serde(default)]
    pub batch: Batch,

    // Named backend pools.
    #[serde(default)]
    pub pools: HashMap<String, Pool>,

    // Database name to pool name routing.
    #[serde(default)]
    pub databases: Databases,
}

impl Config {
    pub fn default_path() -> String {
        String::from("tqdbproxy.toml")
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            path: Self::default_path(),
            general: General::default(),
            prometheus: Prometheus::empty(),
            cache: Cache::default(),
            batch: Batch::default(),
            pools: HashMap::default(),
            databases: Databases::default(),
        }
    }
}

impl Config {
    /// Print current configuration.
    pub fn show(&self) {
        info!("Worker threads: {}", self.general.worker_threads);
        info!("MySQL listener: {}", self.general.mysql_listen);
        if let Some(socket) = &self.general.mysql_socket {
            info!("MySQL unix socket: {socket}");
        }
        info!("PostgreSQL listener: {}", self.general.postgres_listen);
        info!("Connect timeout: {}ms", self.general.connect_timeout);
        info!(
            "Log client connections: {}",
            self.general.log_client_connections
        );
        info!("Write batching enabled: {}", self.batch.enabled);
        info!("Max batch size: {}", self.batch.max_batch_size);
        info!("Cache entries ceiling: {}", self.cache.max_entries);
        info!("Cache grace window: {}s", self.cache.grace_seconds);
        for (pool_name, pool) in &self.pools {
            info!("[pool: {}] Primary: {}", pool_name, pool.primary);
            for (i, replica) in pool.replicas.iter().enumerate() {
                info!("[pool: {}] Replica {}: {}", pool_name, i, replica);
            }
            info!(
                "[pool: {}] Backend pool size: {}",
                pool_name, pool.pool_size
            );
        }
        info!("Default pool: {}", self.databases.default_pool);
    }

    /// Validate the configuration.
    pub fn validate(&mut self) -> Result<(), Error> {
        if self.pools.is_empty() {
            return Err(Error::BadConfig("at least one pool is required".into()));
        }

        if !self.pools.contains_key(&self.databases.default_pool) {
            return Err(Error::BadConfig(format!(
                "databases.default_pool {:?} does not name a configured pool",
                self.databases.default_pool
            )));
        }

        for (db, pool_name) in &self.databases.map {
            if !self.pools.contains_key(pool_name) {
                return Err(Error::BadConfig(format!(
                    "databases.map entry {db:?} points at unknown pool {pool_name:?}"
                )));
            }
        }

        if self.batch.max_batch_size == 0 {
            return Err(Error::BadConfig(
                "batch.max_batch_size must be greater than 0".into(),
            ));
        }

        if self.cache.max_entries == 0 {
            return Err(Error::BadConfig(
                "cache.max_entries must be greater than 0".into(),
            ));
        }

        for pool in self.pools.values_mut() {
            pool.validate()?;
        }

        Ok(())
    }
}

/// Get a read-only instance of the configuration
/// from anywhere in the app.
/// ArcSwap makes this cheap and quick.
pub fn get_config() -> Config {
    (*(*CONFIG.load())).clone()
}

async fn load_file(path: &str) -> Result<String, Error> {
    let mut contents = String::new();
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(err) => {
            return Err(Error::BadConfig(format!("Could not open '{path}': {err}")));
        }
    };
    match file.read_to_string(&mut contents).await {
        Ok(_) => (),
        Err(err) => {
            return Err(Error::BadConfig(format!(
                "Could not read config file: {err}"
            )));
        }
    };
    Ok(contents)
}

/// Parse the configuration file located at the path.
pub async fn parse(path: &str) -> Result<(), Error> {
    let contents = load_file(path).await?;

    let mut config: Config = match toml::from_str(&contents) {
        Ok(config) => config,
        Err(err) => {
            return Err(Error::BadConfig(format!(
                "Could not parse config file {path}: {err}"
            )));
        }
    };

    config.validate()?;

    config.path = path.to_string();

    // Update the configuration globally.
    CONFIG.store(Arc::new(config.clone()));

    Ok(())
}
