//! General configuration settings for the proxy listeners.

use serde_derive::{Deserialize, Serialize};

/// General configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct General {
    /// TCP bind address for the MySQL-family listener.
    #[serde(default = "General::default_mysql_listen")]
    pub mysql_listen: String,

    /// Optional unix socket path for the MySQL-family listener.
    pub mysql_socket: Option<String>,

    /// TCP bind address for the PostgreSQL listener.
    #[serde(default = "General::default_postgres_listen")]
    pub postgres_listen: String,

    #[serde(default = "General::default_connect_timeout")]
    pub connect_timeout: u64,

    #[serde(default = "General::default_worker_threads")]
    pub worker_threads: usize,

    #[serde(default = "General::default_true")]
    pub log_client_connections: bool,

    #[serde(default = "General::default_true")]
    pub log_client_disconnections: bool,

    #[serde(default = "General::default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    // tcp backlog.
    #[serde(default = "General::default_backlog")]
    pub backlog: u32,
}

impl General {
    pub fn default_mysql_listen() -> String {
        String::from("0.0.0.0:3306")
    }

    pub fn default_postgres_listen() -> String {
        String::from("0.0.0.0:5432")
    }

    /// Milliseconds to wait for a backend dial.
    pub fn default_connect_timeout() -> u64 {
        5_000
    }

    pub fn default_worker_threads() -> usize {
        num_cpus::get()
    }

    fn default_true() -> bool {
        true
    }

    pub fn default_shutdown_timeout() -> u64 {
        10_000
    }

    pub fn default_backlog() -> u32 {
        1024
    }
}

impl Default for General {
    fn default() -> General {
        General {
            mysql_listen: Self::default_mysql_listen(),
            mysql_socket: None,
            postgres_listen: Self::default_postgres_listen(),
            connect_timeout: Self::default_connect_timeout(),
            worker_threads: Self::default_worker_threads(),
            log_client_connections: true,
            log_client_disconnections: true,
            shutdown_timeout: Self::default_shutdown_timeout(),
            backlog: Self::default_backlog(),
        }
    }
}
