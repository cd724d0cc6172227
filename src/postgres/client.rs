//! PostgreSQL client front-end.
//!
//! The proxy negotiates a cleartext password with the client and uses
//! those credentials to open its own backend handle on the routed
//! pool's primary. Simple queries are split, parsed for hints, and
//! routed; extended-protocol messages are buffered until Sync, and a
//! window consisting purely of batchable Parse/Bind/Execute traffic is
//! answered synthetically through the write batcher without touching
//! the bound backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, info};
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
use crate::pool::{ReplicaPool, ShardMap};
use crate::postgres::backend::{PgExecutor, PgServer};
use crate::postgres::protocol::{
    auth_ok, bind_complete, bind_message, command_complete, data_row, error_for_client,
    execute_message, parse_bind_message, parse_complete, parse_execute_message, parse_message,
    parse_parse_message, parse_startup_params, plain_password_challenge, read_message,
    read_password, read_startup, ready_for_query, row_description, sync_message, wrong_password,
    write_all_flush, write_tag, CANCEL_REQUEST_CODE, PROTOCOL_VERSION, SSL_REQUEST_CODE,
};
use crate::status::{ConnectionStatus, BACKEND_CACHE, BACKEND_CACHE_STALE};
use crate::utils::clock::now;

/// Shared services injected into every PostgreSQL connection.
pub struct PgServices {
    pub cache: Arc<QueryCache>,
    pub shards: Arc<ShardMap>,
    pub batchers: HashMap<String, WriteBatcher<PgExecutor>>,
    pub batch_enabled: bool,
    pub connect_timeout: Duration,
}

/// One buffered extended-protocol operation.
enum ExtendedOp {
    Parse { name: String },
    Bind { portal: String },
    Execute { portal: String },
    /// Describe, Close, Flush: forces the window onto the backend.
    Other,
}

/// Client entrypoint: startup, cleartext password, backend handle,
/// then the message loop.
pub async fn client_entrypoint<S>(
    mut stream: S,
    addr: String,
    services: Arc<PgServices>,
) -> Result<(), Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + std::marker::Unpin,
{
    let config = get_config();

    // SSLRequest may precede the real startup; TLS is not offered.
    let params = loop {
        let (code, body) = read_startup(&mut stream).await?;
        match code {
            SSL_REQUEST_CODE => {
                write_all_flush(&mut stream, b"N").await?;
            }
            CANCEL_REQUEST_CODE => return Ok(()),
            PROTOCOL_VERSION => break parse_startup_params(body)?,
            code => {
                return Err(Error::ProtocolSyncError(format!(
                    "unexpected startup code {code}"
                )));
            }
        }
    };

    let username = params.get("user").cloned().unwrap_or_default();
    let database = params
        .get("database")
        .cloned()
        .unwrap_or_else(|| username.clone());
    let id = ClientIdentifier::new(&addr, &username, &database);

    plain_password_challenge(&mut stream).await?;
    let password = String::from_utf8_lossy(&read_password(&mut stream).await?).to_string();

    // The client's credentials open our pooled backend handle.
    let pool = services.shards.pool_for(&database);
    let (primary, _) = pool.get_primary();
    let backend_db = pool.backend_database(&database);
    let backend = match PgServer::connect(
        &primary,
        &username,
        &password,
        &backend_db,
        services.connect_timeout,
        "primary",
    )
    .await
    {
        Ok(backend) => backend,
        Err(Error::BackendAuth(reason)) => {
            debug!("Client {id} failed backend auth: {reason}");
            wrong_password(&mut stream, &username).await?;
            return Err(Error::BackendAuth(reason));
        }
        Err(err) => return Err(err),
    };

    let mut greeting = BytesMut::new();
    greeting.put(auth_ok());
    for message in &backend.startup_messages {
        greeting.put_slice(message);
    }
    greeting.put(ready_for_query(b'I'));
    write_all_flush(&mut stream, &greeting).await?;

    if config.general.log_client_connections {
        info!("Client {id} connected (postgres)");
    }

    let shard = services.shards.shard_name_for(&database).to_string();
    let mut client = PgClient {
        stream,
        id,
        backend,
        username,
        password,
        database,
        in_transaction: false,
        prepared: AHashMap::new(),
        portals: AHashMap::new(),
        pending: Vec::new(),
        ops: Vec::new(),
        status: ConnectionStatus::new(&shard),
        pool,
        replica: None,
        services,
    };

    let result = client.handle().await;
    if config.general.log_client_disconnections {
        info!("Client {} disconnected (postgres)", client.id);
    }
    result
}

pub struct PgClient<S> {
    stream: S,
    id: ClientIdentifier,
    backend: PgServer,
    username: String,
    password: String,
    database: String,
    in_transaction: bool,
    /// Prepared-statement table: name → statement captured at Parse.
    prepared: AHashMap<String, ParsedStatement>,
    /// Portal → (statement name, raw Bind parameter section).
    portals: AHashMap<String, (String, Bytes)>,
    /// Raw extended messages buffered until Sync.
    pending: Vec<Bytes>,
    ops: Vec<ExtendedOp>,
    status: ConnectionStatus,
    pool: Arc<ReplicaPool>,
    replica: Option<(PgServer, String)>,
    services: Arc<PgServices>,
}

impl<S> PgClient<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + std::marker::Unpin,
{
    pub async fn handle(&mut self) -> Result<(), Error> {
        loop {
            let (code, message) = match read_message(&mut self.stream).await {
                Ok(message) => message,
                Err(Error::SocketError(_)) => return Ok(()),
                Err(err) => return Err(err),
            };

            if crate::app::server::SHUTDOWN_IN_PROGRESS.load(std::sync::atomic::Ordering::Relaxed)
            {
                let mut shutdown = error_for_client(&Error::ShuttingDown);
                shutdown.put(ready_for_query(b'I'));
                write_all_flush(&mut self.stream, &shutdown).await?;
                return Err(Error::ShuttingDown);
            }

            match code {
                b'X' => {
                    debug!("Client {} sent Terminate", self.id);
                    return Ok(());
                }
                b'Q' => {
                    let body = &message[5..];
                    let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
                    let text = String::from_utf8_lossy(&body[..end]).to_string();
                    self.handle_simple_query(&text).await?;
                }
                b'P' => {
                    let (name, query) = parse_parse_message(&message)?;
                    self.prepared.insert(name.clone(), HintParser::new(&query).parse());
                    self.pending.push(message.freeze());
                    self.ops.push(ExtendedOp::Parse { name });
                }
                b'B' => {
                    let (portal, statement, raw_params) = parse_bind_message(&message)?;
                    self.portals.insert(portal.clone(), (statement, raw_params));
                    self.pending.push(message.freeze());
                    self.ops.push(ExtendedOp::Bind { portal });
                }
                b'E' => {
                    let portal = parse_execute_message(&message)?;
                    self.pending.push(message.freeze());
                    self.ops.push(ExtendedOp::Execute { portal });
                }
                b'D' | b'C' | b'H' => {
                    self.pending.push(message.freeze());
                    self.ops.push(ExtendedOp::Other);
                }
                b'S' => {
                    self.handle_sync().await?;
                }
                code => {
                    return Err(Error::ProtocolSyncError(format!(
                        "unexpected message {:?} from client",
                        code as char
                    )));
                }
            }
        }
    }

    fn ready_status(&self, errored: bool) -> u8 {
        if errored && self.in_transaction {
            b'E'
        } else if self.in_transaction {
            b'T'
        } else {
            b'I'
        }
    }

    // -----------------------------------------------------------------
    // Simple query path
    // -----------------------------------------------------------------

    async fn handle_simple_query(&mut self, text: &str) -> Result<(), Error> {
        let segments = split_statements(text);
        if segments.is_empty() {
            let mut response = BytesMut::new();
            // EmptyQueryResponse.
            response.put_u8(b'I');
            response.put_i32(4);
            response.put(ready_for_query(self.ready_status(false)));
            return write_all_flush(&mut self.stream, &response).await;
        }

        let mut response = BytesMut::new();
        let mut errored = false;
        for segment in &segments {
            let started = now();
            let result = self.route_statement(segment, &mut response).await;
            QUERY_LATENCY_SECONDS.observe(started.elapsed().as_secs_f64());
            match result {
                Ok(()) => {}
                // A statement error aborts the rest of the query string.
                Err(err) if !err.is_fatal_for_connection() => {
                    response.put(error_for_client(&err));
                    errored = true;
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        response.put(ready_for_query(self.ready_status(errored)));
        write_all_flush(&mut self.stream, &response).await
    }

    /// Route one statement of a simple query; its response messages are
    /// appended to `response`. A recoverable statement failure is
    /// returned as `Err` with a non-fatal error.
    async fn route_statement(
        &mut self,
        segment: &str,
        response: &mut BytesMut,
    ) -> Result<(), Error> {
        let parsed = HintParser::new(segment).parse();
        let kind = kind_label(parsed.kind);

        match parsed.kind {
            StatementKind::ShowStatus => {
                observe_query(parsed.file.as_deref(), parsed.line, "status", false);
                self.append_status_result(response);
                return Ok(());
            }
            StatementKind::Begin | StatementKind::Commit | StatementKind::Rollback => {
                observe_query(parsed.file.as_deref(), parsed.line, kind, false);
                return self.forward_segment(&parsed.text, response).await;
            }
            _ => {}
        }

        if self.in_transaction {
            observe_query(parsed.file.as_deref(), parsed.line, kind, false);
            return self.forward_segment(&parsed.text, response).await;
        }

        if parsed.is_batchable() && self.services.batch_enabled {
            observe_query(parsed.file.as_deref(), parsed.line, kind, false);
            return self.batched_write(&parsed, response).await;
        }

        if parsed.is_cacheable() {
            return self.cached_read(&parsed, response).await;
        }

        observe_query(parsed.file.as_deref(), parsed.line, kind, false);
        self.forward_segment(&parsed.text, response).await
    }

    async fn forward_segment(
        &mut self,
        text: &str,
        response: &mut BytesMut,
    ) -> Result<(), Error> {
        let backend_response = self.backend.simple_query_response(text).await?;
        self.in_transaction = matches!(backend_response.ready_status, b'T' | b'E');
        for message in &backend_response.messages {
            response.put_slice(message);
        }
        self.status.backend("primary");
        Ok(())
    }

    async fn batched_write(
        &mut self,
        parsed: &ParsedStatement,
        response: &mut BytesMut,
    ) -> Result<(), Error> {
        let batcher = &self.services.batchers[&self.pool.name];
        let item = BatchItem::text(&parsed.stripped);

        match batcher
            .enqueue(parsed.batch_key(), item, parsed.batch_ms, None)
            .await
        {
            Ok(result) => {
                self.status.batched(result.batch_size);
                response.put(command_complete(&write_tag(
                    parsed.kind,
                    result.affected_rows,
                )));
                Ok(())
            }
            Err(Error::BatcherClosed) | Err(Error::BatcherTimeout) => {
                debug!(
                    "batcher unavailable for {}, falling back to direct write",
                    self.id
                );
                self.forward_segment(&parsed.stripped, response).await
            }
            Err(error) => Err(error),
        }
    }

    async fn cached_read(
        &mut self,
        parsed: &ParsedStatement,
        response: &mut BytesMut,
    ) -> Result<(), Error> {
        let key = parsed.stripped.as_bytes().to_vec();
        let ttl = Duration::from_secs(parsed.ttl_seconds);
        let kind = kind_label(parsed.kind);

        if let Some((bytes, flag)) = self.services.cache.get(&key) {
            match flag {
                CacheFlag::Fresh => {
                    CACHE_HITS_TOTAL.inc();
                    observe_query(parsed.file.as_deref(), parsed.line, kind, true);
                    self.status.backend(BACKEND_CACHE);
                    response.put_slice(&bytes);
                    return Ok(());
                }
                CacheFlag::Stale => {
                    CACHE_STALE_TOTAL.inc();
                    observe_query(parsed.file.as_deref(), parsed.line, kind, true);
                    self.status.backend(BACKEND_CACHE_STALE);
                    response.put_slice(&bytes);
                    return Ok(());
                }
                CacheFlag::Refresh => {
                    CACHE_MISSES_TOTAL.inc();
                    observe_query(parsed.file.as_deref(), parsed.line, kind, false);
                    return match self.fetch_from_replica(&parsed.stripped).await {
                        Ok(fresh) => {
                            self.services.cache.set_and_notify(&key, fresh.clone(), ttl);
                            response.put_slice(&fresh);
                            Ok(())
                        }
                        Err(error) => {
                            self.services.cache.cancel_inflight(&key);
                            Err(error)
                        }
                    };
                }
            }
        }

        match self.services.cache.get_or_wait(&key).await {
            (None, false) => {
                CACHE_MISSES_TOTAL.inc();
                observe_query(parsed.file.as_deref(), parsed.line, kind, false);
                match self.fetch_from_replica(&parsed.stripped).await {
                    Ok(bytes) => {
                        self.services.cache.set_and_notify(&key, bytes.clone(), ttl);
                        response.put_slice(&bytes);
                        Ok(())
                    }
                    Err(error) => {
                        self.services.cache.cancel_inflight(&key);
                        Err(error)
                    }
                }
            }
            (Some(bytes), _) => {
                CACHE_HITS_TOTAL.inc();
                observe_query(parsed.file.as_deref(), parsed.line, kind, true);
                self.status.backend(BACKEND_CACHE);
                response.put_slice(&bytes);
                Ok(())
            }
            (None, true) => {
                CACHE_MISSES_TOTAL.inc();
                observe_query(parsed.file.as_deref(), parsed.line, kind, false);
                let bytes = self.fetch_from_replica(&parsed.stripped).await?;
                self.services.cache.set(&key, bytes.clone(), ttl);
                response.put_slice(&bytes);
                Ok(())
            }
        }
    }

    /// Run a read on this connection's replica handle; the returned
    /// bytes are the response messages (RowDescription through
    /// CommandComplete) ready for replay.
    async fn fetch_from_replica(&mut self, text: &str) -> Result<Bytes, Error> {
        self.ensure_replica().await?;
        let (replica, label) = self.replica.as_mut().unwrap();

        let backend_response = match replica.simple_query_response(text).await {
            Ok(response) => response,
            Err(error) => {
                self.replica = None;
                return Err(error);
            }
        };
        if let Some(error) = backend_response.error {
            return Err(error);
        }

        let mut bytes = BytesMut::new();
        for message in &backend_response.messages {
            bytes.put_slice(message);
        }
        let label = label.clone();
        self.status.backend(&label);
        Ok(bytes.freeze())
    }

    async fn ensure_replica(&mut self) -> Result<(), Error> {
        if self.replica.is_some() {
            return Ok(());
        }
        let (address, label) = self.pool.get_replica();
        let database = self.pool.backend_database(&self.database);
        let server = PgServer::connect(
            &address,
            &self.username,
            &self.password,
            &database,
            self.services.connect_timeout,
            &label,
        )
        .await?;
        self.replica = Some((server, label));
        Ok(())
    }

    fn append_status_result(&mut self, response: &mut BytesMut) {
        let batches_total = self.services.batchers[&self.pool.name].batches_executed();
        let rows = self.status.rows(batches_total);
        response.put(row_description(&["Variable_name", "Value"]));
        for (name, value) in &rows {
            response.put(data_row(&[name.as_str(), value.as_str()]));
        }
        response.put(command_complete(&format!("SELECT {}", rows.len())));
    }

    // -----------------------------------------------------------------
    // Extended query path
    // -----------------------------------------------------------------

    /// A Sync arrived: either answer the whole window synthetically
    /// (pure batchable or cacheable Parse/Bind/Execute traffic) or
    /// forward it to the bound backend.
    async fn handle_sync(&mut self) -> Result<(), Error> {
        let pending = std::mem::take(&mut self.pending);
        let ops = std::mem::take(&mut self.ops);

        let result = match self.classify_window(&ops) {
            WindowKind::Batch => self.sync_batched(&pending, &ops).await,
            WindowKind::Cache => self.sync_cached(&ops).await,
            WindowKind::Forward => self.sync_forward(&pending).await,
        };
        self.portals.clear();
        result
    }

    fn classify_window(&self, ops: &[ExtendedOp]) -> WindowKind {
        if self.in_transaction || ops.is_empty() {
            return WindowKind::Forward;
        }

        let mut executes = 0usize;
        let mut all_batchable = true;
        let mut all_cacheable = true;
        for op in ops {
            match op {
                ExtendedOp::Other => return WindowKind::Forward,
                ExtendedOp::Parse { name } => {
                    let Some(statement) = self.prepared.get(name) else {
                        return WindowKind::Forward;
                    };
                    all_batchable &= statement.is_batchable();
                    all_cacheable &= statement.is_cacheable();
                }
                ExtendedOp::Bind { portal } | ExtendedOp::Execute { portal } => {
                    let Some(statement) = self.portal_statement(portal) else {
                        return WindowKind::Forward;
                    };
                    all_batchable &= statement.is_batchable();
                    all_cacheable &= statement.is_cacheable();
                    if matches!(op, ExtendedOp::Execute { .. }) {
                        executes += 1;
                    }
                }
            }
        }

        if executes == 0 {
            return WindowKind::Forward;
        }
        if all_batchable && self.services.batch_enabled {
            return WindowKind::Batch;
        }
        if all_cacheable && executes == 1 {
            return WindowKind::Cache;
        }
        WindowKind::Forward
    }

    fn portal_statement(&self, portal: &str) -> Option<&ParsedStatement> {
        let (statement_name, _) = self.portals.get(portal)?;
        self.prepared.get(statement_name)
    }

    /// Forward the buffered window plus the Sync and relay everything.
    async fn sync_forward(&mut self, pending: &[Bytes]) -> Result<(), Error> {
        let mut buffer = BytesMut::new();
        for message in pending {
            buffer.put_slice(message);
        }
        buffer.put(sync_message());

        let backend_response = self.backend.forward_raw(&buffer).await?;
        self.in_transaction = matches!(backend_response.ready_status, b'T' | b'E');

        let mut response = BytesMut::new();
        for message in &backend_response.messages {
            response.put_slice(message);
        }
        response.put(ready_for_query(backend_response.ready_status));
        self.status.backend("primary");
        write_all_flush(&mut self.stream, &response).await
    }

    /// Answer a purely batchable window through the batcher: the bound
    /// backend is never consulted.
    async fn sync_batched(&mut self, pending: &[Bytes], ops: &[ExtendedOp]) -> Result<(), Error> {
        let mut response = BytesMut::new();
        let mut errored = false;

        for op in ops {
            if errored {
                break;
            }
            match op {
                ExtendedOp::Parse { .. } => response.put(parse_complete()),
                ExtendedOp::Bind { .. } => response.put(bind_complete()),
                ExtendedOp::Execute { portal } => {
                    let Some((statement_name, raw_params)) = self.portals.get(portal).cloned()
                    else {
                        errored = true;
                        response.put(error_for_client(&Error::PreparedStatementNotFound(
                            portal.clone(),
                        )));
                        continue;
                    };
                    let Some(statement) = self.prepared.get(&statement_name).cloned() else {
                        errored = true;
                        response.put(error_for_client(&Error::PreparedStatementNotFound(
                            statement_name,
                        )));
                        continue;
                    };

                    observe_query(
                        statement.file.as_deref(),
                        statement.line,
                        kind_label(statement.kind),
                        false,
                    );
                    let batcher = &self.services.batchers[&self.pool.name];
                    let item = BatchItem {
                        query: statement.stripped.clone(),
                        params: raw_params,
                    };
                    match batcher
                        .enqueue(statement.batch_key(), item, statement.batch_ms, None)
                        .await
                    {
                        Ok(result) => {
                            self.status.batched(result.batch_size);
                            response.put(command_complete(&write_tag(
                                statement.kind,
                                result.affected_rows,
                            )));
                        }
                        Err(Error::BatcherClosed) | Err(Error::BatcherTimeout) => {
                            // The window never reached the backend; the
                            // whole of it can still run there directly.
                            debug!(
                                "batcher unavailable for {}, forwarding extended window",
                                self.id
                            );
                            return self.sync_forward(pending).await;
                        }
                        Err(batch_error) => {
                            errored = true;
                            response.put(error_for_client(&batch_error));
                        }
                    }
                }
                ExtendedOp::Other => unreachable!("classify_window filters Other"),
            }
        }

        response.put(ready_for_query(b'I'));
        write_all_flush(&mut self.stream, &response).await
    }

    /// Answer a single cacheable Execute window from the cache,
    /// fetching via a replica when elected.
    async fn sync_cached(&mut self, ops: &[ExtendedOp]) -> Result<(), Error> {
        // Synthetic completions for everything before the Execute.
        let mut prefix = BytesMut::new();
        let mut target: Option<String> = None;
        for op in ops {
            match op {
                ExtendedOp::Parse { .. } => prefix.put(parse_complete()),
                ExtendedOp::Bind { .. } => prefix.put(bind_complete()),
                ExtendedOp::Execute { portal } => target = Some(portal.clone()),
                ExtendedOp::Other => unreachable!("classify_window filters Other"),
            }
        }
        let portal = target.expect("classify_window requires one Execute");
        let (statement_name, raw_params) = self.portals.get(&portal).cloned().ok_or_else(|| {
            Error::PreparedStatementNotFound(portal.clone())
        })?;
        let statement = self
            .prepared
            .get(&statement_name)
            .cloned()
            .ok_or_else(|| Error::PreparedStatementNotFound(statement_name.clone()))?;

        let key = prepared_cache_key(&self.database, &statement.stripped, &raw_params);
        let ttl = Duration::from_secs(statement.ttl_seconds);
        let kind = kind_label(statement.kind);

        let outcome: Result<(Bytes, bool), Error> = {
            if let Some((bytes, flag)) = self.services.cache.get(&key) {
                match flag {
                    CacheFlag::Fresh => {
                        CACHE_HITS_TOTAL.inc();
                        self.status.backend(BACKEND_CACHE);
                        Ok((bytes, true))
                    }
                    CacheFlag::Stale => {
                        CACHE_STALE_TOTAL.inc();
                        self.status.backend(BACKEND_CACHE_STALE);
                        Ok((bytes, true))
                    }
                    CacheFlag::Refresh => {
                        CACHE_MISSES_TOTAL.inc();
                        match self
                            .fetch_extended_from_replica(&statement.stripped, &raw_params)
                            .await
                        {
                            Ok(fresh) => {
                                self.services.cache.set_and_notify(&key, fresh.clone(), ttl);
                                Ok((fresh, false))
                            }
                            Err(fetch_error) => {
                                self.services.cache.cancel_inflight(&key);
                                Err(fetch_error)
                            }
                        }
                    }
                }
            } else {
                match self.services.cache.get_or_wait(&key).await {
                    (None, false) => {
                        CACHE_MISSES_TOTAL.inc();
                        match self
                            .fetch_extended_from_replica(&statement.stripped, &raw_params)
                            .await
                        {
                            Ok(bytes) => {
                                self.services.cache.set_and_notify(&key, bytes.clone(), ttl);
                                Ok((bytes, false))
                            }
                            Err(fetch_error) => {
                                self.services.cache.cancel_inflight(&key);
                                Err(fetch_error)
                            }
                        }
                    }
                    (Some(bytes), _) => {
                        CACHE_HITS_TOTAL.inc();
                        self.status.backend(BACKEND_CACHE);
                        Ok((bytes, true))
                    }
                    (None, true) => {
                        CACHE_MISSES_TOTAL.inc();
                        match self
                            .fetch_extended_from_replica(&statement.stripped, &raw_params)
                            .await
                        {
                            Ok(bytes) => {
                                self.services.cache.set(&key, bytes.clone(), ttl);
                                Ok((bytes, false))
                            }
                            Err(fetch_error) => Err(fetch_error),
                        }
                    }
                }
            }
        };

        let mut response = prefix;
        match outcome {
            Ok((bytes, cached)) => {
                observe_query(statement.file.as_deref(), statement.line, kind, cached);
                response.put_slice(&bytes);
            }
            Err(error) if !error.is_fatal_for_connection() => {
                observe_query(statement.file.as_deref(), statement.line, kind, false);
                response.put(error_for_client(&error));
            }
            Err(error) => return Err(error),
        }
        response.put(ready_for_query(b'I'));
        write_all_flush(&mut self.stream, &response).await
    }

    /// Execute a prepared read on the replica handle via the extended
    /// protocol; the Parse/BindComplete frames are dropped so the
    /// cached bytes hold only RowDescription through CommandComplete.
    async fn fetch_extended_from_replica(
        &mut self,
        text: &str,
        raw_params: &Bytes,
    ) -> Result<Bytes, Error> {
        self.ensure_replica().await?;
        let (replica, label) = self.replica.as_mut().unwrap();

        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&parse_message("", text));
        buffer.extend_from_slice(&bind_message("", "", raw_params));
        buffer.extend_from_slice(&execute_message(""));
        buffer.extend_from_slice(&sync_message());

        let backend_response = match replica.forward_raw(&buffer).await {
            Ok(response) => response,
            Err(fetch_error) => {
                self.replica = None;
                return Err(fetch_error);
            }
        };
        if let Some(fetch_error) = backend_response.error {
            return Err(fetch_error);
        }

        let mut bytes = BytesMut::new();
        for message in &backend_response.messages {
            // ParseComplete and BindComplete belong to this window, not
            // to the cached reply.
            if matches!(message.first(), Some(&b'1') | Some(&b'2')) {
                continue;
            }
            bytes.put_slice(message);
        }
        let label = label.clone();
        self.status.backend(&label);
        Ok(bytes.freeze())
    }
}

enum WindowKind {
    Batch,
    Cache,
    Forward,
}

/// Cache key for a prepared read, as a digest over the selected
/// database, the stripped query, and the raw parameter bytes.
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
    fn test_prepared_cache_key_isolates_databases() {
        let params = Bytes::from_static(b"\x00\x00\x00\x01");
        let a = prepared_cache_key("app", "SELECT * FROM t WHERE id = $1", &params);
        let b = prepared_cache_key("other", "SELECT * FROM t WHERE id = $1", &params);
        assert_ne!(a, b);
    }
}
