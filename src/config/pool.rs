//! Backend pool configuration.

use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::Error;

use super::Address;

/// A named backend pool: one primary, zero or more replicas, and the
/// credentials the proxy uses for its own backend handles (write batcher
/// data source and replica read connections).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Pool {
    pub primary: Address,

    #[serde(default)]
    pub replicas: Vec<Address>,

    /// Username for proxy-owned backend connections.
    pub user: String,

    /// Password for proxy-owned backend connections.
    pub password: String,

    /// The real name of the database on the server. If it is not
    /// specified, the routed database name is used.
    pub database: Option<String>,

    /// Number of physical connections behind the batcher's data source.
    #[serde(default = "Pool::default_pool_size")]
    pub pool_size: usize,
}

impl Pool {
    pub fn default_pool_size() -> usize {
        8
    }

    pub fn validate(&mut self) -> Result<(), Error> {
        if self.user.is_empty() {
            return Err(Error::BadConfig("pool user must not be empty".into()));
        }
        if self.pool_size == 0 {
            return Err(Error::BadConfig(
                "pool_size must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Database name to pool name routing, with a default pool for names
/// that are not listed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Databases {
    #[serde(default = "Databases::default_default_pool")]
    pub default_pool: String,

    #[serde(default)]
    pub map: HashMap<String, String>,
}

impl Databases {
    pub fn default_default_pool() -> String {
        String::from("main")
    }

    /// Resolve a database name to the pool that serves it.
    pub fn pool_for(&self, database: &str) -> &str {
        self.map
            .get(database)
            .map(|s| s.as_str())
            .unwrap_or(self.default_pool.as_str())
    }
}

impl Default for Databases {
    fn default() -> Databases {
        Databases {
            default_pool: Self::default_default_pool(),
            map: HashMap::default(),
        }
    }
}
