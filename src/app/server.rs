//! Process bootstrap: build the shared services, start the two
//! protocol listeners and the metrics exporter, and drive graceful
//! shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::{TcpListener, UnixListener};
use tokio::runtime::Builder;

use crate::cache::QueryCache;
use crate::config::Config;
use crate::metrics::{start_metrics_server, CLIENT_CONNECTIONS_TOTAL};
use crate::mysql::{self, MysqlDialer, MysqlExecutor, MysqlServices};
use crate::pool::ShardMap;
use crate::postgres::{self, PgDialer, PgExecutor, PgServices};
use crate::batch::WriteBatcher;

/// Global flag indicating graceful shutdown is in progress.
pub static SHUTDOWN_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

pub fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Builder::new_multi_thread()
        .worker_threads(config.general.worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let shards = Arc::new(ShardMap::from_config(&config)?);
    let cache = Arc::new(QueryCache::from_config(&config.cache));
    let connect_timeout = Duration::from_millis(config.general.connect_timeout);

    // One batcher per pool and dialect; each serves a single backend
    // database.
    let mut mysql_batchers = HashMap::new();
    let mut pg_batchers = HashMap::new();
    for (name, pool) in &config.pools {
        let database = pool.database.clone().unwrap_or_else(|| name.clone());

        let mysql_dialer = MysqlDialer {
            address: pool.primary.clone(),
            username: pool.user.clone(),
            password: pool.password.clone(),
            database: database.clone(),
            connect_timeout,
        };
        mysql_batchers.insert(
            name.clone(),
            WriteBatcher::from_config(
                MysqlExecutor::new(mysql_dialer, pool.pool_size),
                &config.batch,
            ),
        );

        let pg_dialer = PgDialer {
            address: pool.primary.clone(),
            username: pool.user.clone(),
            password: pool.password.clone(),
            database,
            connect_timeout,
        };
        pg_batchers.insert(
            name.clone(),
            WriteBatcher::from_config(PgExecutor::new(pg_dialer, pool.pool_size), &config.batch),
        );
    }

    let mysql_services = Arc::new(MysqlServices {
        cache: cache.clone(),
        shards: shards.clone(),
        batchers: mysql_batchers,
        batch_enabled: config.batch.enabled,
        connect_timeout,
    });
    let pg_services = Arc::new(PgServices {
        cache,
        shards,
        batchers: pg_batchers,
        batch_enabled: config.batch.enabled,
        connect_timeout,
    });

    // MySQL-family TCP listener.
    let mysql_listener = TcpListener::bind(&config.general.mysql_listen).await?;
    info!("mysql listener on {}", config.general.mysql_listen);
    {
        let services = mysql_services.clone();
        tokio::spawn(async move {
            loop {
                match mysql_listener.accept().await {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        CLIENT_CONNECTIONS_TOTAL.with_label_values(&["mysql"]).inc();
                        let services = services.clone();
                        tokio::spawn(async move {
                            if let Err(err) =
                                mysql::client_entrypoint(stream, addr.to_string(), services).await
                            {
                                error!("mysql client {addr}: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        error!("mysql accept error: {err}");
                    }
                }
            }
        });
    }

    // Optional MySQL-family unix socket listener.
    if let Some(path) = config.general.mysql_socket.clone() {
        let _ = std::fs::remove_file(&path);
        let unix_listener = UnixListener::bind(&path)?;
        info!("mysql listener on unix:{path}");
        let services = mysql_services.clone();
        tokio::spawn(async move {
            loop {
                match unix_listener.accept().await {
                    Ok((stream, _)) => {
                        CLIENT_CONNECTIONS_TOTAL.with_label_values(&["mysql"]).inc();
                        let services = services.clone();
                        let addr = format!("unix:{path}");
                        tokio::spawn(async move {
                            if let Err(err) =
                                mysql::client_entrypoint(stream, addr, services).await
                            {
                                error!("mysql client (unix): {err}");
                            }
                        });
                    }
                    Err(err) => {
                        error!("mysql unix accept error: {err}");
                    }
                }
            }
        });
    }

    // PostgreSQL TCP listener.
    let pg_listener = TcpListener::bind(&config.general.postgres_listen).await?;
    info!("postgres listener on {}", config.general.postgres_listen);
    {
        let services = pg_services.clone();
        tokio::spawn(async move {
            loop {
                match pg_listener.accept().await {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        CLIENT_CONNECTIONS_TOTAL
                            .with_label_values(&["postgres"])
                            .inc();
                        let services = services.clone();
                        tokio::spawn(async move {
                            if let Err(err) =
                                postgres::client_entrypoint(stream, addr.to_string(), services)
                                    .await
                            {
                                error!("postgres client {addr}: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        error!("postgres accept error: {err}");
                    }
                }
            }
        });
    }

    // Prometheus exporter.
    if config.prometheus.enabled {
        let host = format!("{}:{}", config.prometheus.host, config.prometheus.port);
        tokio::spawn(async move {
            start_metrics_server(&host).await;
        });
    }

    wait_for_shutdown().await;

    SHUTDOWN_IN_PROGRESS.store(true, Ordering::Relaxed);
    warn!("shutdown requested, closing write batchers");
    for batcher in mysql_services.batchers.values() {
        batcher.close();
    }
    for batcher in pg_services.batchers.values() {
        batcher.close();
    }

    // Let in-flight flushes and replies drain.
    tokio::time::sleep(Duration::from_millis(config.general.shutdown_timeout)).await;
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = interrupt.recv() => info!("received SIGINT"),
        _ = terminate.recv() => info!("received SIGTERM"),
    }
}
