//! Configuration parsing and validation tests.

use super::*;

fn minimal_toml() -> &'static str {
    r#"
[general]
mysql_listen = "127.0.0.1:13306"
postgres_listen = "127.0.0.1:15432"

[pools.main]
primary = "127.0.0.1:3306"
replicas = ["127.0.0.1:3307", "unix:/tmp/replica.sock"]
user = "proxy"
password = "secret"

[databases]
default_pool = "main"

[databases.map]
app = "main"
"#
}

#[test]
fn test_parse_minimal_config() {
    let mut config: Config = toml::from_str(minimal_toml()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.general.mysql_listen, "127.0.0.1:13306");
    assert_eq!(config.general.postgres_listen, "127.0.0.1:15432");

    let pool = &config.pools["main"];
    assert_eq!(pool.primary, Address::Tcp("127.0.0.1:3306".into()));
    assert_eq!(pool.replicas.len(), 2);
    assert_eq!(pool.replicas[1], Address::Unix("/tmp/replica.sock".into()));
    assert_eq!(pool.pool_size, Pool::default_pool_size());

    assert_eq!(config.databases.pool_for("app"), "main");
    assert_eq!(config.databases.pool_for("unlisted"), "main");
}

#[test]
fn test_defaults() {
    let config: Config = toml::from_str(minimal_toml()).unwrap();

    assert!(config.batch.enabled);
    assert_eq!(config.batch.max_batch_size, 1_000);
    assert_eq!(config.batch.enqueue_timeout, 30_000);
    assert_eq!(config.cache.max_entries, 16_384);
    assert_eq!(config.cache.grace_seconds, 10);
    assert!(!config.prometheus.enabled);
}

#[test]
fn test_validate_rejects_unknown_default_pool() {
    let mut config: Config = toml::from_str(minimal_toml()).unwrap();
    config.databases.default_pool = "nope".into();

    let err = config.validate().unwrap_err();
    assert!(matches!(err, Error::BadConfig(_)));
}

#[test]
fn test_validate_rejects_dangling_database_mapping() {
    let mut config: Config = toml::from_str(minimal_toml()).unwrap();
    config
        .databases
        .map
        .insert("orders".into(), "missing".into());

    assert!(config.validate().is_err());
}

#[test]
fn test_validate_rejects_zero_batch_size() {
    let mut config: Config = toml::from_str(minimal_toml()).unwrap();
    config.batch.max_batch_size = 0;

    assert!(config.validate().is_err());
}

#[test]
fn test_validate_rejects_empty_pool_user() {
    let mut config: Config = toml::from_str(minimal_toml()).unwrap();
    config.pools.get_mut("main").unwrap().user = String::new();

    assert!(config.validate().is_err());
}

#[tokio::test]
#[serial_test::serial]
async fn test_parse_from_file() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(minimal_toml().as_bytes()).unwrap();

    parse(file.path().to_str().unwrap()).await.unwrap();

    let config = get_config();
    assert_eq!(config.pools.len(), 1);
    assert_eq!(config.databases.default_pool, "main");
}

#[tokio::test]
async fn test_parse_missing_file() {
    let err = parse("/nonexistent/tqdbproxy.toml").await.unwrap_err();
    assert!(matches!(err, Error::BadConfig(_)));
}
