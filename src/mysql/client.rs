//! MySQL-family client front-end.
//!
//! The proxy relays the real backend's handshake (salt and server
//! capabilities, with TLS masked off) to the client and the client's
//! authentication response back, so the bound backend link carries the
//! client's own credentials. Every statement is then parsed for hints
//! and routed: transactional traffic sticks to the bound link, hinted
//! writes go through the batcher, hinted reads through the cache and a
//! replica.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use bytes::Bytes;
use log::{debug, error, info};
use xxhash_rust::xxh3::xxh3_128;

use crate::batch::{BatchItem, WriteBatcher};
use crate::cache::{CacheFlag, QueryCache};
use crate::config::get_config;
use crate::errors::{ClientIdentifier, Error};
use crate::hints::{split_statements, HintParser, ParsedStatement, StatementKind};
use crate::metrics::{
    observe_query, CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL, CACHE_STALE_TOTAL,
    QUERY_LATENCY_SECONDS,
};
use crate::mysql::backend::{MysqlExecutor, MysqlServer};
use crate::mysql::constants::*;
use crate::mysql::protocol::{
    backend_error_parts, com_query, err_payload, frame_payloads, normalize_execute_tail,
    ok_payload, parse_handshake_response, patch_more_results, read_packet, result_set_payloads,
    split_stmt_execute, strip_ssl_capability, write_packet, write_payloads, PrepareOk,
    QueryResponse,
};
use crate::net;
use crate::pool::{ReplicaPool, ShardMap};
use crate::status::{ConnectionStatus, BACKEND_CACHE, BACKEND_CACHE_STALE};
use crate::utils::clock::now;

/// Shared services injected into every MySQL-family connection.
pub struct MysqlServices {
    pub cache: Arc<QueryCache>,
    pub shards: Arc<ShardMap>,
    pub batchers: HashMap<String, WriteBatcher<MysqlExecutor>>,
    pub batch_enabled: bool,
    pub connect_timeout: Duration,
}

struct PreparedEntry {
    statement: ParsedStatement,
    num_params: u16,
    /// Parameter types of the first execute, spliced back into later
    /// executes that omit them.
    param_types: Option<Bytes>,
}

/// Client entrypoint: handshake relay, then the command loop.
pub async fn client_entrypoint<S>(
    mut stream: S,
    addr: String,
    services: Arc<MysqlServices>,
) -> Result<(), Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + std::marker::Unpin,
{
    let config = get_config();
    let pool = services.shards.pool_for("");

    // Server speaks first: dial the default pool's primary and relay
    // its greeting.
    let (primary, _) = pool.get_primary();
    let mut backend = net::connect(&primary, services.connect_timeout).await?;

    let (greeting_seq, greeting) = read_packet(&mut backend).await?;
    if greeting.first() == Some(&ERR_HEADER) {
        write_packet(&mut stream, greeting_seq, &greeting).await?;
        return Err(Error::BackendAuth(format!(
            "backend {primary} refused the connection"
        )));
    }
    let handshake = crate::mysql::protocol::parse_initial_handshake(&greeting)?;
    let relayed = strip_ssl_capability(&greeting)?;
    write_packet(&mut stream, greeting_seq, &relayed).await?;

    // Client's response, relayed back verbatim.
    let (response_seq, response) = read_packet(&mut stream).await?;
    if response.len() >= 4 {
        let requested = u32::from_le_bytes([response[0], response[1], response[2], response[3]]);
        if requested & CLIENT_SSL != 0 && response.len() <= 32 {
            // An SSLRequest; TLS is not offered.
            write_packet(
                &mut stream,
                response_seq.wrapping_add(1),
                &err_payload(3159, "HY000", "TLS is not supported by this proxy"),
            )
            .await?;
            return Err(Error::ProtocolSyncError(
                "client attempted TLS negotiation".into(),
            ));
        }
    }
    let client_hello = parse_handshake_response(&response)?;
    write_packet(&mut backend, response_seq, &response).await?;

    // Relay the rest of the authentication exchange until it settles.
    loop {
        let (seq, packet) = read_packet(&mut backend).await?;
        write_packet(&mut stream, seq, &packet).await?;
        match packet.first().copied() {
            Some(OK_HEADER) => break,
            Some(ERR_HEADER) => {
                return Err(Error::BackendAuth(format!(
                    "backend rejected credentials for {:?}",
                    client_hello.username
                )));
            }
            // Auth switch or more-data: the client answers.
            _ => {
                let (seq, answer) = read_packet(&mut stream).await?;
                write_packet(&mut backend, seq, &answer).await?;
            }
        }
    }

    let capabilities = client_hello.capabilities & handshake.capabilities & !CLIENT_SSL;
    let database = client_hello.database.clone().unwrap_or_default();
    let id = ClientIdentifier::new(&addr, &client_hello.username, &database);
    if config.general.log_client_connections {
        info!("Client {id} connected (mysql)");
    }

    // The database named at startup may route to a different pool than
    // the default one the handshake went through.
    let mut client = MysqlClient {
        stream,
        id,
        backend: MysqlServer::from_relay(backend, capabilities, "primary"),
        capabilities,
        database: database.clone(),
        in_transaction: false,
        prepared: AHashMap::new(),
        status: ConnectionStatus::new(services.shards.shard_name_for(&database)),
        pool,
        replica: None,
        services,
    };
    if !database.is_empty() {
        client.switch_pool_if_needed(&database.clone()).await?;
    }

    let result = client.handle().await;
    if config.general.log_client_disconnections {
        info!("Client {} disconnected (mysql)", client.id);
    }
    result
}

pub struct MysqlClient<S> {
    stream: S,
    id: ClientIdentifier,
    /// Bound backend link; re-dialed on shard switch.
    backend: MysqlServer,
    capabilities: u32,
    database: String,
    in_transaction: bool,
    prepared: AHashMap<u32, PreparedEntry>,
    status: ConnectionStatus,
    pool: Arc<ReplicaPool>,
    /// Lazily opened proxy-owned handle for replica reads, retained
    /// for the connection's lifetime.
    replica: Option<(MysqlServer, String)>,
    services: Arc<MysqlServices>,
}

impl<S> MysqlClient<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + std::marker::Unpin,
{
    fn base_status(&self) -> u16 {
        if self.in_transaction {
            SERVER_STATUS_IN_TRANS
        } else {
            SERVER_STATUS_AUTOCOMMIT
        }
    }

    fn deprecate_eof(&self) -> bool {
        self.capabilities & CLIENT_DEPRECATE_EOF != 0
    }

    /// Main command loop.
    pub async fn handle(&mut self) -> Result<(), Error> {
        loop {
            let (_, packet) = match read_packet(&mut self.stream).await {
                Ok(message) => message,
                // The client hung up; that is a normal way to leave.
                Err(Error::SocketError(_)) => return Ok(()),
                Err(err) => return Err(err),
            };
            let Some(&command) = packet.first() else {
                return Err(Error::ProtocolSyncError("empty command packet".into()));
            };

            if crate::app::server::SHUTDOWN_IN_PROGRESS.load(std::sync::atomic::Ordering::Relaxed)
            {
                write_packet(
                    &mut self.stream,
                    1,
                    &err_payload(1053, "08S01", "proxy is shutting down"),
                )
                .await?;
                return Err(Error::ShuttingDown);
            }

            match command {
                COM_QUIT => {
                    debug!("Client {} sent COM_QUIT", self.id);
                    return Ok(());
                }
                COM_PING => {
                    let status = self.base_status();
                    write_packet(&mut self.stream, 1, &ok_payload(0, 0, status)).await?;
                }
                COM_QUERY => {
                    let text = String::from_utf8_lossy(&packet[1..]).to_string();
                    self.handle_query(&text).await?;
                }
                COM_INIT_DB => {
                    let database = String::from_utf8_lossy(&packet[1..]).to_string();
                    self.handle_database_switch(&database).await?;
                }
                COM_STMT_PREPARE => {
                    let text = String::from_utf8_lossy(&packet[1..]).to_string();
                    self.handle_prepare(&text).await?;
                }
                COM_STMT_EXECUTE => {
                    self.handle_execute(&packet.freeze()).await?;
                }
                COM_STMT_CLOSE => {
                    if packet.len() >= 5 {
                        let statement_id =
                            u32::from_le_bytes([packet[1], packet[2], packet[3], packet[4]]);
                        self.prepared.remove(&statement_id);
                    }
                    // Fire-and-forget on the wire; no response.
                    self.backend.send_command_no_response(&packet).await?;
                }
                _ => {
                    // Anything else is passed through untouched.
                    let response = self.backend.roundtrip(&packet).await?;
                    self.finish_forwarded(response, false, 1).await?;
                }
            }
        }
    }

    /// A COM_QUERY possibly carrying several `;`-separated statements.
    async fn handle_query(&mut self, text: &str) -> Result<(), Error> {
        let segments = split_statements(text);
        if segments.is_empty() {
            let status = self.base_status();
            write_packet(&mut self.stream, 1, &ok_payload(0, 0, status)).await?;
            return Ok(());
        }

        let multi = segments.len() > 1;
        let mut seq = 1u8;
        for (index, segment) in segments.iter().enumerate() {
            let more = index + 1 < segments.len();
            seq = self.route_statement(segment, more, multi, seq).await?;
        }
        Ok(())
    }

    /// Route one statement per the transaction state, its hints, and
    /// its kind. Returns the next response sequence id.
    async fn route_statement(
        &mut self,
        segment: &str,
        more: bool,
        multi: bool,
        seq: u8,
    ) -> Result<u8, Error> {
        let parsed = HintParser::new(segment).parse();
        let started = now();
        let result = self.dispatch(&parsed, more, multi, seq).await;
        QUERY_LATENCY_SECONDS.observe(started.elapsed().as_secs_f64());
        result
    }

    async fn dispatch(
        &mut self,
        parsed: &ParsedStatement,
        more: bool,
        multi: bool,
        seq: u8,
    ) -> Result<u8, Error> {
        match parsed.kind {
            StatementKind::ShowStatus => {
                observe_query(parsed.file.as_deref(), parsed.line, "status", false);
                return self.write_status_result(more, seq).await;
            }
            StatementKind::Use => {
                let database = parsed.database.clone().unwrap_or_default();
                self.handle_database_switch_inline(&database, more, seq).await?;
                return Ok(seq.wrapping_add(1));
            }
            StatementKind::Begin | StatementKind::Commit | StatementKind::Rollback => {
                observe_query(parsed.file.as_deref(), parsed.line, kind_label(parsed.kind), false);
                return self.forward_statement(&parsed.text, more, seq).await;
            }
            _ => {}
        }

        // Inside an open transaction everything is forwarded; the
        // batcher is never consulted.
        if self.in_transaction {
            observe_query(parsed.file.as_deref(), parsed.line, kind_label(parsed.kind), false);
            return self.forward_statement(&parsed.text, more, seq).await;
        }

        if parsed.is_batchable() && self.services.batch_enabled {
            observe_query(parsed.file.as_deref(), parsed.line, kind_label(parsed.kind), false);
            return self.batched_write(parsed, more, seq).await;
        }

        // The cache only serves whole replies; a statement inside a
        // multi-statement query keeps its backend round-trip.
        if parsed.is_cacheable() && !multi {
            return self.cached_read(parsed, seq).await;
        }

        observe_query(parsed.file.as_deref(), parsed.line, kind_label(parsed.kind), false);
        self.forward_statement(&parsed.text, more, seq).await
    }

    /// Forward one text statement on the bound backend link and relay
    /// the response.
    async fn forward_statement(&mut self, text: &str, more: bool, seq: u8) -> Result<u8, Error> {
        let response = self.backend.roundtrip(&com_query(text)).await?;
        self.finish_forwarded(response, more, seq).await
    }

    async fn finish_forwarded(
        &mut self,
        mut response: QueryResponse,
        more: bool,
        seq: u8,
    ) -> Result<u8, Error> {
        if !response.is_error() {
            self.in_transaction = response.status() & SERVER_STATUS_IN_TRANS != 0;
        }
        patch_more_results(&mut response.payloads, more);
        let next = write_payloads(&mut self.stream, seq, &response.payloads).await?;
        self.status.backend("primary");
        Ok(next)
    }

    /// Enqueue a batchable text write; fall back to a direct write when
    /// the batcher is closed or timed out.
    async fn batched_write(
        &mut self,
        parsed: &ParsedStatement,
        more: bool,
        seq: u8,
    ) -> Result<u8, Error> {
        let batcher = &self.services.batchers[&self.pool.name];
        let item = BatchItem::text(&parsed.stripped);

        match batcher
            .enqueue(parsed.batch_key(), item, parsed.batch_ms, None)
            .await
        {
            Ok(result) => {
                self.status.batched(result.batch_size);
                let mut payloads = vec![ok_payload(
                    result.affected_rows,
                    result.last_insert_id,
                    self.base_status(),
                )];
                patch_more_results(&mut payloads, more);
                write_payloads(&mut self.stream, seq, &payloads).await
            }
            Err(Error::BatcherClosed) | Err(Error::BatcherTimeout) => {
                debug!(
                    "batcher unavailable for {}, falling back to direct write",
                    self.id
                );
                self.forward_statement(&parsed.stripped, more, seq).await
            }
            Err(error) => self.write_backend_error(&error, seq).await,
        }
    }

    /// Serve a hinted read through the cache, fetching from a replica
    /// when this caller is elected.
    async fn cached_read(&mut self, parsed: &ParsedStatement, seq: u8) -> Result<u8, Error> {
        let key = parsed.stripped.as_bytes().to_vec();
        let ttl = Duration::from_secs(parsed.ttl_seconds);
        let kind = kind_label(parsed.kind);

        if let Some((bytes, flag)) = self.services.cache.get(&key) {
            match flag {
                CacheFlag::Fresh => {
                    CACHE_HITS_TOTAL.inc();
                    observe_query(parsed.file.as_deref(), parsed.line, kind, true);
                    self.status.backend(BACKEND_CACHE);
                    return self.write_raw(&bytes, seq).await;
                }
                CacheFlag::Stale => {
                    CACHE_STALE_TOTAL.inc();
                    observe_query(parsed.file.as_deref(), parsed.line, kind, true);
                    self.status.backend(BACKEND_CACHE_STALE);
                    return self.write_raw(&bytes, seq).await;
                }
                CacheFlag::Refresh => {
                    // This caller was elected: refresh synchronously.
                    CACHE_MISSES_TOTAL.inc();
                    observe_query(parsed.file.as_deref(), parsed.line, kind, false);
                    return match self.fetch_from_replica(&parsed.stripped).await {
                        Ok(fresh) => {
                            self.services.cache.set_and_notify(&key, fresh.clone(), ttl);
                            self.write_raw(&fresh, seq).await
                        }
                        Err(error) => {
                            self.services.cache.cancel_inflight(&key);
                            self.write_backend_error(&error, seq).await
                        }
                    };
                }
            }
        }

        match self.services.cache.get_or_wait(&key).await {
            // Elected to fetch for everyone.
            (None, false) => {
                CACHE_MISSES_TOTAL.inc();
                observe_query(parsed.file.as_deref(), parsed.line, kind, false);
                match self.fetch_from_replica(&parsed.stripped).await {
                    Ok(bytes) => {
                        self.services.cache.set_and_notify(&key, bytes.clone(), ttl);
                        self.write_raw(&bytes, seq).await
                    }
                    Err(error) => {
                        self.services.cache.cancel_inflight(&key);
                        self.write_backend_error(&error, seq).await
                    }
                }
            }
            // A peer delivered its fetch.
            (Some(bytes), _) => {
                CACHE_HITS_TOTAL.inc();
                observe_query(parsed.file.as_deref(), parsed.line, kind, true);
                self.status.backend(BACKEND_CACHE);
                self.write_raw(&bytes, seq).await
            }
            // The peer's fetch failed or timed out; fetch solo.
            (None, true) => {
                CACHE_MISSES_TOTAL.inc();
                observe_query(parsed.file.as_deref(), parsed.line, kind, false);
                match self.fetch_from_replica(&parsed.stripped).await {
                    Ok(bytes) => {
                        self.services.cache.set(&key, bytes.clone(), ttl);
                        self.write_raw(&bytes, seq).await
                    }
                    Err(error) => self.write_backend_error(&error, seq).await,
                }
            }
        }
    }

    /// Run a read on this connection's replica handle, returning the
    /// framed response bytes ready for replay.
    async fn fetch_from_replica(&mut self, text: &str) -> Result<Bytes, Error> {
        self.ensure_replica().await?;
        let (replica, label) = self.replica.as_mut().unwrap();

        let response = match replica.query(text).await {
            Ok(response) => response,
            Err(error) => {
                // The handle is suspect; it will be re-dialed lazily.
                self.replica = None;
                return Err(error);
            }
        };
        if let Some(error) = response.error() {
            return Err(error);
        }
        let label = label.clone();
        self.status.backend(&label);
        Ok(frame_payloads(&response.payloads, 1))
    }

    async fn ensure_replica(&mut self) -> Result<(), Error> {
        if self.replica.is_some() {
            return Ok(());
        }
        let (address, label) = self.pool.get_replica();
        let database = self.pool.backend_database(&self.database);
        let server = MysqlServer::connect(
            &address,
            &self.pool.settings.user,
            &self.pool.settings.password,
            &database,
            self.services.connect_timeout,
            &label,
        )
        .await?;
        self.replica = Some((server, label));
        Ok(())
    }

    /// COM_STMT_PREPARE: relay to the bound backend and remember the
    /// statement for execute-time routing.
    async fn handle_prepare(&mut self, text: &str) -> Result<(), Error> {
        let parsed = HintParser::new(text).parse();
        let (result, payloads) = self.backend.prepare_with_payloads(text).await?;

        if let Ok(ok) = result {
            self.prepared.insert(
                ok.statement_id,
                PreparedEntry {
                    statement: parsed,
                    num_params: ok.num_params,
                    param_types: None,
                },
            );
        }
        write_payloads(&mut self.stream, 1, &payloads).await?;
        Ok(())
    }

    /// COM_STMT_EXECUTE: batchable writes divert to the batcher with
    /// their bound parameters; cacheable reads go through the cache
    /// keyed by a digest of (database, query, parameter bytes).
    async fn handle_execute(&mut self, packet: &Bytes) -> Result<(), Error> {
        let (statement_id, tail) = split_stmt_execute(packet)?;

        let Some(entry) = self.prepared.get_mut(&statement_id) else {
            // Unknown to us; let the backend answer.
            let response = self.backend.roundtrip(packet).await?;
            self.finish_forwarded(response, false, 1).await?;
            return Ok(());
        };

        let normalized = normalize_execute_tail(&tail, entry.num_params, entry.param_types.as_ref());
        let tail = match normalized {
            Ok((tail, types)) => {
                if let Some(types) = types {
                    entry.param_types = Some(types);
                }
                tail
            }
            Err(_) => {
                // Could not make sense of the parameters; plain relay.
                let response = self.backend.roundtrip(packet).await?;
                self.finish_forwarded(response, false, 1).await?;
                return Ok(());
            }
        };

        let statement = entry.statement.clone();
        let kind = kind_label(statement.kind);

        if statement.is_batchable() && !self.in_transaction && self.services.batch_enabled {
            observe_query(statement.file.as_deref(), statement.line, kind, false);
            let batcher = &self.services.batchers[&self.pool.name];
            let item = BatchItem {
                query: statement.stripped.clone(),
                params: tail.clone(),
            };
            match batcher
                .enqueue(statement.batch_key(), item, statement.batch_ms, None)
                .await
            {
                Ok(result) => {
                    self.status.batched(result.batch_size);
                    let status = self.base_status();
                    write_packet(
                        &mut self.stream,
                        1,
                        &ok_payload(result.affected_rows, result.last_insert_id, status),
                    )
                    .await?;
                    return Ok(());
                }
                Err(Error::BatcherClosed) | Err(Error::BatcherTimeout) => {
                    debug!(
                        "batcher unavailable for {}, executing prepared write directly",
                        self.id
                    );
                    let response = self.backend.roundtrip(packet).await?;
                    self.finish_forwarded(response, false, 1).await?;
                    return Ok(());
                }
                Err(error) => {
                    self.write_backend_error(&error, 1).await?;
                    return Ok(());
                }
            }
        }

        if statement.is_cacheable() && !self.in_transaction {
            let key = prepared_cache_key(&self.database, &statement.stripped, &tail);
            let ttl = Duration::from_secs(statement.ttl_seconds);

            if let Some((bytes, flag)) = self.services.cache.get(&key) {
                match flag {
                    CacheFlag::Fresh | CacheFlag::Stale => {
                        if flag == CacheFlag::Fresh {
                            CACHE_HITS_TOTAL.inc();
                            self.status.backend(BACKEND_CACHE);
                        } else {
                            CACHE_STALE_TOTAL.inc();
                            self.status.backend(BACKEND_CACHE_STALE);
                        }
                        observe_query(statement.file.as_deref(), statement.line, kind, true);
                        self.write_raw(&bytes, 1).await?;
                        return Ok(());
                    }
                    CacheFlag::Refresh => {
                        CACHE_MISSES_TOTAL.inc();
                        observe_query(statement.file.as_deref(), statement.line, kind, false);
                        match self.fetch_prepared_from_replica(&statement.stripped, &tail).await {
                            Ok(bytes) => {
                                self.services.cache.set_and_notify(&key, bytes.clone(), ttl);
                                self.write_raw(&bytes, 1).await?;
                            }
                            Err(error) => {
                                self.services.cache.cancel_inflight(&key);
                                self.write_backend_error(&error, 1).await?;
                            }
                        }
                        return Ok(());
                    }
                }
            }

            match self.services.cache.get_or_wait(&key).await {
                (None, false) => {
                    CACHE_MISSES_TOTAL.inc();
                    observe_query(statement.file.as_deref(), statement.line, kind, false);
                    match self.fetch_prepared_from_replica(&statement.stripped, &tail).await {
                        Ok(bytes) => {
                            self.services.cache.set_and_notify(&key, bytes.clone(), ttl);
                            self.write_raw(&bytes, 1).await?;
                        }
                        Err(error) => {
                            self.services.cache.cancel_inflight(&key);
                            self.write_backend_error(&error, 1).await?;
                        }
                    }
                }
                (Some(bytes), _) => {
                    CACHE_HITS_TOTAL.inc();
                    observe_query(statement.file.as_deref(), statement.line, kind, true);
                    self.status.backend(BACKEND_CACHE);
                    self.write_raw(&bytes, 1).await?;
                }
                (None, true) => {
                    CACHE_MISSES_TOTAL.inc();
                    observe_query(statement.file.as_deref(), statement.line, kind, false);
                    match self.fetch_prepared_from_replica(&statement.stripped, &tail).await {
                        Ok(bytes) => {
                            self.services.cache.set(&key, bytes.clone(), ttl);
                            self.write_raw(&bytes, 1).await?;
                        }
                        Err(error) => {
                            self.write_backend_error(&error, 1).await?;
                        }
                    }
                }
            }
            return Ok(());
        }

        // Native prepared execution on the bound link.
        observe_query(statement.file.as_deref(), statement.line, kind, false);
        let response = self.backend.roundtrip(packet).await?;
        self.finish_forwarded(response, false, 1).await?;
        Ok(())
    }

    /// Execute a prepared read on the replica handle.
    async fn fetch_prepared_from_replica(
        &mut self,
        text: &str,
        tail: &Bytes,
    ) -> Result<Bytes, Error> {
        self.ensure_replica().await?;
        let (replica, label) = self.replica.as_mut().unwrap();

        let run = async {
            let prepared: PrepareOk = replica.prepare(text).await?;
            let response = replica
                .roundtrip(&crate::mysql::protocol::com_stmt_execute(
                    prepared.statement_id,
                    tail,
                ))
                .await?;
            let _ = replica.stmt_close(prepared.statement_id).await;
            Ok::<QueryResponse, Error>(response)
        };

        let response = match run.await {
            Ok(response) => response,
            Err(error) => {
                self.replica = None;
                return Err(error);
            }
        };
        if let Some(error) = response.error() {
            return Err(error);
        }
        let label = label.clone();
        self.status.backend(&label);
        Ok(frame_payloads(&response.payloads, 1))
    }

    /// `USE db` issued as a statement inside a (possibly multi-
    /// statement) query.
    async fn handle_database_switch_inline(
        &mut self,
        database: &str,
        more: bool,
        seq: u8,
    ) -> Result<(), Error> {
        match self.switch_database(database).await {
            Ok(()) => {
                let mut payloads = vec![ok_payload(0, 0, self.base_status())];
                patch_more_results(&mut payloads, more);
                write_payloads(&mut self.stream, seq, &payloads).await?;
                Ok(())
            }
            Err(error) => {
                self.write_backend_error(&error, seq).await?;
                Ok(())
            }
        }
    }

    /// COM_INIT_DB.
    async fn handle_database_switch(&mut self, database: &str) -> Result<(), Error> {
        match self.switch_database(database).await {
            Ok(()) => {
                let status = self.base_status();
                write_packet(&mut self.stream, 1, &ok_payload(0, 0, status)).await?;
                Ok(())
            }
            Err(error) => {
                self.write_backend_error(&error, 1).await?;
                Ok(())
            }
        }
    }

    async fn switch_database(&mut self, database: &str) -> Result<(), Error> {
        self.switch_pool_if_needed(database).await?;
        let backend_db = self.pool.backend_database(database);
        self.backend.init_db(&backend_db).await?;
        self.database = database.to_string();
        Ok(())
    }

    /// Re-dial the bound backend when the database maps to another
    /// pool. The new link authenticates with the pool's configured
    /// credentials; the client's own password never reaches the proxy.
    async fn switch_pool_if_needed(&mut self, database: &str) -> Result<(), Error> {
        let target = self.services.shards.pool_for(database);
        if target.name == self.pool.name {
            return Ok(());
        }

        debug!(
            "Client {} switching shard {} -> {}",
            self.id, self.pool.name, target.name
        );
        let (address, _) = target.get_primary();
        let backend_db = target.backend_database(database);
        let backend = MysqlServer::connect(
            &address,
            &target.settings.user,
            &target.settings.password,
            &backend_db,
            self.services.connect_timeout,
            "primary",
        )
        .await?;

        self.backend = backend;
        self.pool = target;
        // Statement ids were minted by the old backend.
        self.prepared.clear();
        self.replica = None;
        self.in_transaction = false;
        self.status.shard(&self.pool.name);
        Ok(())
    }

    /// `SHOW TQDB STATUS`.
    async fn write_status_result(&mut self, more: bool, seq: u8) -> Result<u8, Error> {
        let batches_total = self.services.batchers[&self.pool.name].batches_executed();
        let rows: Vec<Vec<String>> = self
            .status
            .rows(batches_total)
            .into_iter()
            .map(|(name, value)| vec![name, value])
            .collect();
        let mut status = self.base_status();
        if more {
            status |= SERVER_MORE_RESULTS_EXISTS;
        }
        let payloads = result_set_payloads(
            &["Variable_name", "Value"],
            &rows,
            self.deprecate_eof(),
            status,
        );
        write_payloads(&mut self.stream, seq, &payloads).await
    }

    /// Replay pre-framed bytes (cache hits) to the client.
    async fn write_raw(&mut self, bytes: &Bytes, _seq: u8) -> Result<u8, Error> {
        use tokio::io::AsyncWriteExt;
        self.stream
            .write_all(bytes)
            .await
            .map_err(|err| Error::SocketError(format!("Failed to write to client: {err}")))?;
        self.stream
            .flush()
            .await
            .map_err(|err| Error::SocketError(format!("Failed to flush client socket: {err}")))?;
        Ok(0)
    }

    /// Surface a backend error to the client as a dialect error packet.
    async fn write_backend_error(&mut self, error: &Error, seq: u8) -> Result<u8, Error> {
        error!("Client {}: {error}", self.id);
        let (code, state, message) = backend_error_parts(error);
        let next = write_packet(&mut self.stream, seq, &err_payload(code, &state, &message)).await?;
        Ok(next)
    }
}

/// Cache key for a prepared read: a digest over the selected database,
/// the stripped query text, and the raw bound parameter bytes, so
/// different bindings never collide across sessions.
fn prepared_cache_key(database: &str, stripped: &str, params: &Bytes) -> Vec<u8> {
    let mut input = Vec::with_capacity(database.len() + stripped.len() + params.len() + 2);
    input.extend_from_slice(database.as_bytes());
    input.push(0);
    input.extend_from_slice(stripped.as_bytes());
    input.push(0);
    input.extend_from_slice(params);
    xxh3_128(&input).to_le_bytes().to_vec()
}

fn kind_label(kind: StatementKind) -> &'static str {
    match kind {
        StatementKind::Select => "select",
        StatementKind::Insert => "insert",
        StatementKind::Update => "update",
        StatementKind::Delete => "delete",
        StatementKind::Begin => "begin",
        StatementKind::Commit => "commit",
        StatementKind::Rollback => "rollback",
        StatementKind::Use => "use",
        StatementKind::ShowStatus => "status",
        StatementKind::Other => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepared_cache_key_varies_with_params() {
        let a = prepared_cache_key("db", "SELECT * FROM t WHERE id = ?", &Bytes::from_static(b"\x01"));
        let b = prepared_cache_key("db", "SELECT * FROM t WHERE id = ?", &Bytes::from_static(b"\x02"));
        let c = prepared_cache_key("other", "SELECT * FROM t WHERE id = ?", &Bytes::from_static(b"\x01"));

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(kind_label(StatementKind::Select), "select");
        assert_eq!(kind_label(StatementKind::Other), "other");
    }
}
