//! Backend pools: named {primary, replicas} groups with round-robin
//! replica selection, and the database-name routing table in front of
//! them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{self, Address};
use crate::errors::Error;

pub mod backend;

/// One named backend group. Reads go to a replica picked round-robin;
/// writes and everything else go to the primary.
pub struct ReplicaPool {
    pub name: String,
    primary: Address,
    replicas: Vec<Address>,
    next: AtomicUsize,
    /// Credentials and sizing for proxy-owned backend handles.
    pub settings: config::Pool,
}

impl ReplicaPool {
    pub fn new(name: &str, settings: config::Pool) -> ReplicaPool {
        ReplicaPool {
            name: name.to_string(),
            primary: settings.primary.clone(),
            replicas: settings.replicas.clone(),
            next: AtomicUsize::new(0),
            settings,
        }
    }

    /// The primary address, labeled "primary".
    pub fn get_primary(&self) -> (Address, String) {
        (self.primary.clone(), "primary".to_string())
    }

    /// The next replica address by atomic round-robin. Falls back to
    /// the primary when no replicas are configured.
    pub fn get_replica(&self) -> (Address, String) {
        if self.replicas.is_empty() {
            return self.get_primary();
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.replicas.len();
        (self.replicas[index].clone(), format!("replicas[{index}]"))
    }

    /// The database name to use on the server side.
    pub fn backend_database(&self, routed: &str) -> String {
        self.settings
            .database
            .clone()
            .unwrap_or_else(|| routed.to_string())
    }
}

/// Database-name → pool resolution over the configured pools.
pub struct ShardMap {
    pools: HashMap<String, Arc<ReplicaPool>>,
    databases: config::Databases,
}

impl ShardMap {
    pub fn from_config(config: &config::Config) -> Result<ShardMap, Error> {
        let mut pools = HashMap::new();
        for (name, settings) in &config.pools {
            pools.insert(
                name.clone(),
                Arc::new(ReplicaPool::new(name, settings.clone())),
            );
        }
        if !pools.contains_key(&config.databases.default_pool) {
            return Err(Error::BadConfig(format!(
                "default pool {:?} is not configured",
                config.databases.default_pool
            )));
        }
        Ok(ShardMap {
            pools,
            databases: config.databases.clone(),
        })
    }

    /// Resolve the pool serving a client-selected database.
    pub fn pool_for(&self, database: &str) -> Arc<ReplicaPool> {
        let name = self.databases.pool_for(database);
        // Validated at load time: every mapping and the default point
        // at a configured pool.
        self.pools[name].clone()
    }

    pub fn shard_name_for(&self, database: &str) -> &str {
        self.databases.pool_for(database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(primary: &str, replicas: &[&str]) -> config::Pool {
        config::Pool {
            primary: Address::parse(primary),
            replicas: replicas.iter().map(|r| Address::parse(r)).collect(),
            user: "proxy".into(),
            password: "secret".into(),
            database: None,
            pool_size: 4,
        }
    }

    #[test]
    fn test_round_robin_replicas() {
        let pool = ReplicaPool::new("main", settings("p:3306", &["r0:3306", "r1:3306"]));

        let (addr, label) = pool.get_replica();
        assert_eq!(addr, Address::Tcp("r0:3306".into()));
        assert_eq!(label, "replicas[0]");

        let (addr, label) = pool.get_replica();
        assert_eq!(addr, Address::Tcp("r1:3306".into()));
        assert_eq!(label, "replicas[1]");

        let (_, label) = pool.get_replica();
        assert_eq!(label, "replicas[0]");
    }

    #[test]
    fn test_replica_falls_back_to_primary() {
        let pool = ReplicaPool::new("main", settings("p:3306", &[]));

        let (addr, label) = pool.get_replica();
        assert_eq!(addr, Address::Tcp("p:3306".into()));
        assert_eq!(label, "primary");
    }

    #[test]
    fn test_primary_label() {
        let pool = ReplicaPool::new("main", settings("unix:/tmp/db.sock", &[]));

        let (addr, label) = pool.get_primary();
        assert!(addr.is_unix());
        assert_eq!(label, "primary");
    }

    #[test]
    fn test_shard_map_routing() {
        let mut config = config::Config::default();
        config.pools.insert("main".into(), settings("p:3306", &[]));
        config
            .pools
            .insert("orders".into(), settings("o:3306", &[]));
        config.databases.default_pool = "main".into();
        config
            .databases
            .map
            .insert("orders_db".into(), "orders".into());

        let shards = ShardMap::from_config(&config).unwrap();
        assert_eq!(shards.pool_for("orders_db").name, "orders");
        assert_eq!(shards.pool_for("anything_else").name, "main");
        assert_eq!(shards.shard_name_for("orders_db"), "orders");
    }

    #[test]
    fn test_shard_map_rejects_missing_default() {
        let mut config = config::Config::default();
        config.pools.insert("main".into(), settings("p:3306", &[]));
        config.databases.default_pool = "missing".into();

        assert!(ShardMap::from_config(&config).is_err());
    }

    #[test]
    fn test_backend_database_override() {
        let mut s = settings("p:3306", &[]);
        s.database = Some("real_db".into());
        let pool = ReplicaPool::new("main", s);
        assert_eq!(pool.backend_database("client_db"), "real_db");

        let pool = ReplicaPool::new("main", settings("p:3306", &[]));
        assert_eq!(pool.backend_database("client_db"), "client_db");
    }
}
