//! Proxy-owned MySQL backend connections and the batcher's executor.
//!
//! These connections authenticate with the pool's configured
//! credentials (`mysql_native_password`); the client-bound backend link
//! is established separately by the handshake relay and never passes
//! through here.

use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};

use crate::batch::{BatchExecutor, BatchItem, WriteOutcome};
use crate::config::Address;
use crate::errors::Error;
use crate::metrics::BACKEND_QUERIES_TOTAL;
use crate::mysql::constants::*;
use crate::mysql::protocol::{
    com_init_db, com_query, com_stmt_close, com_stmt_execute, com_stmt_prepare,
    handshake_response_payload, native_password_scramble, parse_err, parse_initial_handshake,
    read_full_response, read_packet, read_prepare_response, write_packet, OkData, PrepareOk,
    QueryResponse, ResponseKind,
};
use crate::net::{self, BackendStream};
use crate::pool::backend::{BackendPool, Dialer};

/// One authenticated backend connection.
pub struct MysqlServer {
    stream: BackendStream,
    capabilities: u32,
    label: String,
}

impl MysqlServer {
    /// Dial and authenticate with `mysql_native_password`.
    pub async fn connect(
        address: &Address,
        username: &str,
        password: &str,
        database: &str,
        connect_timeout: Duration,
        label: &str,
    ) -> Result<MysqlServer, Error> {
        let mut stream = net::connect(address, connect_timeout).await?;

        let (_, greeting) = read_packet(&mut stream).await?;
        if greeting.first() == Some(&ERR_HEADER) {
            let err = parse_err(&greeting);
            return Err(Error::BackendAuth(format!("server refused {address}: {err}")));
        }
        let handshake = parse_initial_handshake(&greeting)?;

        let capabilities = PROXY_CAPABILITIES & handshake.capabilities;
        if capabilities & CLIENT_PROTOCOL_41 == 0 {
            return Err(Error::BackendAuth(format!(
                "server {address} does not speak protocol 4.1"
            )));
        }

        let scramble = native_password_scramble(password, &handshake.auth_data);
        let response = handshake_response_payload(capabilities, username, &scramble, database);
        write_packet(&mut stream, 1, &response).await?;

        loop {
            let (reply_seq, reply) = read_packet(&mut stream).await?;
            match reply.first().copied() {
                Some(OK_HEADER) => break,
                Some(ERR_HEADER) => {
                    let err = parse_err(&reply);
                    return Err(Error::BackendAuth(format!(
                        "authentication rejected by {address}: {err}"
                    )));
                }
                Some(AUTH_SWITCH_HEADER) => {
                    // AuthSwitchRequest: plugin name, then a fresh nonce.
                    let body = &reply[1..];
                    let nul = body.iter().position(|b| *b == 0).ok_or_else(|| {
                        Error::ProtocolSyncError("malformed auth switch request".into())
                    })?;
                    let plugin = String::from_utf8_lossy(&body[..nul]).to_string();
                    if plugin != NATIVE_PASSWORD_PLUGIN {
                        return Err(Error::BackendAuth(format!(
                            "unsupported auth plugin {plugin} requested by {address}"
                        )));
                    }
                    let mut nonce = &body[nul + 1..];
                    if nonce.last() == Some(&0) {
                        nonce = &nonce[..nonce.len() - 1];
                    }
                    let scramble = native_password_scramble(password, nonce);
                    write_packet(&mut stream, reply_seq.wrapping_add(1), &scramble).await?;
                }
                _ => {
                    return Err(Error::BackendAuth(format!(
                        "unexpected packet during authentication with {address}"
                    )));
                }
            }
        }

        debug!("connected to mysql backend {address} ({label}) as {username}");
        Ok(MysqlServer {
            stream,
            capabilities,
            label: label.to_string(),
        })
    }

    /// Wrap a stream whose handshake was relayed between the client
    /// and the backend; the link is already authenticated with the
    /// client's own credentials.
    pub fn from_relay(stream: BackendStream, capabilities: u32, label: &str) -> MysqlServer {
        MysqlServer {
            stream,
            capabilities,
            label: label.to_string(),
        }
    }

    /// Send one command payload that has no response (COM_STMT_CLOSE).
    pub async fn send_command_no_response(&mut self, command: &[u8]) -> Result<(), Error> {
        write_packet(&mut self.stream, 0, command).await?;
        Ok(())
    }

    /// Send one command payload and read its complete response.
    pub async fn roundtrip(&mut self, command: &[u8]) -> Result<QueryResponse, Error> {
        write_packet(&mut self.stream, 0, command).await?;
        BACKEND_QUERIES_TOTAL.with_label_values(&[&self.label]).inc();
        read_full_response(&mut self.stream, self.capabilities).await
    }

    /// Run a text statement and return its full response.
    pub async fn query(&mut self, text: &str) -> Result<QueryResponse, Error> {
        self.roundtrip(&com_query(text)).await
    }

    /// Run a text statement that must produce an OK.
    pub async fn execute_ok(&mut self, text: &str) -> Result<OkData, Error> {
        let response = self.query(text).await?;
        match response.kind {
            ResponseKind::Ok(ok) => Ok(ok),
            ResponseKind::Error => Err(response.error().unwrap_or_else(|| {
                Error::ProtocolSyncError("error response without payload".into())
            })),
            ResponseKind::ResultSet { .. } => Err(Error::ProtocolSyncError(format!(
                "expected OK for {text:?}, got a result set"
            ))),
        }
    }

    /// Prepare a statement, discarding the metadata packets.
    pub async fn prepare(&mut self, text: &str) -> Result<PrepareOk, Error> {
        let (result, _payloads) = self.prepare_with_payloads(text).await?;
        result
    }

    /// Prepare a statement, keeping the full response for relay to a
    /// client. The outer error is an I/O failure; the inner one a
    /// backend refusal whose packets are still relayable.
    pub async fn prepare_with_payloads(
        &mut self,
        text: &str,
    ) -> Result<(Result<PrepareOk, Error>, Vec<Bytes>), Error> {
        write_packet(&mut self.stream, 0, &com_stmt_prepare(text)).await?;
        BACKEND_QUERIES_TOTAL.with_label_values(&[&self.label]).inc();
        read_prepare_response(&mut self.stream, self.capabilities).await
    }

    /// Execute a prepared statement with a raw parameter tail.
    pub async fn stmt_execute(&mut self, statement_id: u32, tail: &[u8]) -> Result<OkData, Error> {
        let response = self.roundtrip(&com_stmt_execute(statement_id, tail)).await?;
        match response.kind {
            ResponseKind::Ok(ok) => Ok(ok),
            ResponseKind::Error => Err(response.error().unwrap_or_else(|| {
                Error::ProtocolSyncError("error response without payload".into())
            })),
            ResponseKind::ResultSet { .. } => Err(Error::ProtocolSyncError(
                "expected OK for prepared write, got a result set".into(),
            )),
        }
    }

    /// COM_STMT_CLOSE has no response.
    pub async fn stmt_close(&mut self, statement_id: u32) -> Result<(), Error> {
        write_packet(&mut self.stream, 0, &com_stmt_close(statement_id)).await?;
        Ok(())
    }

    pub async fn init_db(&mut self, database: &str) -> Result<OkData, Error> {
        let response = self.roundtrip(&com_init_db(database)).await?;
        match response.kind {
            ResponseKind::Ok(ok) => Ok(ok),
            _ => Err(response.error().unwrap_or_else(|| {
                Error::ProtocolSyncError("unexpected COM_INIT_DB response".into())
            })),
        }
    }
}

/// Dials primary connections for the batcher's data source.
pub struct MysqlDialer {
    pub address: Address,
    pub username: String,
    pub password: String,
    pub database: String,
    pub connect_timeout: Duration,
}

impl Dialer for MysqlDialer {
    type Conn = MysqlServer;

    async fn dial(&self) -> Result<MysqlServer, Error> {
        MysqlServer::connect(
            &self.address,
            &self.username,
            &self.password,
            &self.database,
            self.connect_timeout,
            "primary",
        )
        .await
    }
}

/// The write batcher's backend executor: one logical data source with a
/// small pool of physical connections.
pub struct MysqlExecutor {
    pool: BackendPool<MysqlDialer>,
}

impl MysqlExecutor {
    pub fn new(dialer: MysqlDialer, pool_size: usize) -> MysqlExecutor {
        MysqlExecutor {
            pool: BackendPool::new(dialer, pool_size),
        }
    }

    async fn run_single(conn: &mut MysqlServer, item: &BatchItem) -> Result<WriteOutcome, Error> {
        let ok = if item.params.is_empty() {
            conn.execute_ok(&item.query).await?
        } else {
            let prepared = conn.prepare(&item.query).await?;
            let result = conn.stmt_execute(prepared.statement_id, &item.params).await;
            let _ = conn.stmt_close(prepared.statement_id).await;
            result?
        };
        Ok(WriteOutcome {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
        })
    }

    async fn run_batch(
        conn: &mut MysqlServer,
        items: &[BatchItem],
    ) -> Result<Vec<WriteOutcome>, Error> {
        conn.execute_ok("BEGIN").await?;

        let identical = items
            .windows(2)
            .all(|pair| pair[0].query == pair[1].query);
        let prepared_path = identical && !items[0].params.is_empty();

        let execute = async {
            let mut outcomes = Vec::with_capacity(items.len());
            if prepared_path {
                // Canonical path: prepare once, execute once per
                // request with its own parameters.
                let prepared = conn.prepare(&items[0].query).await?;
                for item in items {
                    let ok = conn.stmt_execute(prepared.statement_id, &item.params).await?;
                    outcomes.push(WriteOutcome {
                        affected_rows: ok.affected_rows,
                        last_insert_id: ok.last_insert_id,
                    });
                }
                let _ = conn.stmt_close(prepared.statement_id).await;
            } else {
                // Mixed texts: same transaction, no statement reuse.
                for item in items {
                    outcomes.push(Self::run_single(conn, item).await?);
                }
            }
            Ok::<Vec<WriteOutcome>, Error>(outcomes)
        };

        match execute.await {
            Ok(outcomes) => {
                conn.execute_ok("COMMIT").await?;
                Ok(outcomes)
            }
            Err(error) => {
                if let Err(rollback_error) = conn.execute_ok("ROLLBACK").await {
                    warn!("rollback after failed batch also failed: {rollback_error}");
                }
                Err(error)
            }
        }
    }
}

impl BatchExecutor for MysqlExecutor {
    async fn execute_single(&self, item: &BatchItem) -> Result<WriteOutcome, Error> {
        let (mut conn, permit) = self.pool.get().await?;
        match Self::run_single(&mut conn, item).await {
            Ok(outcome) => {
                self.pool.put(conn);
                drop(permit);
                Ok(outcome)
            }
            Err(error) => {
                // The connection may hold half-read state; drop it.
                drop(conn);
                drop(permit);
                Err(error)
            }
        }
    }

    async fn execute_batch(&self, items: &[BatchItem]) -> Result<Vec<WriteOutcome>, Error> {
        let (mut conn, permit) = self.pool.get().await?;
        match Self::run_batch(&mut conn, items).await {
            Ok(outcomes) => {
                self.pool.put(conn);
                drop(permit);
                Ok(outcomes)
            }
            Err(error) => {
                drop(conn);
                drop(permit);
                Err(error)
            }
        }
    }
}
