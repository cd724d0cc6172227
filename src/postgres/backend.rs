//! Proxy-owned PostgreSQL backend connections and the batcher's
//! executor for the PostgreSQL dialect.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, warn};

use crate::batch::{BatchExecutor, BatchItem, WriteOutcome};
use crate::config::Address;
use crate::errors::Error;
use crate::metrics::BACKEND_QUERIES_TOTAL;
use crate::net::{self, BackendStream};
use crate::pool::backend::{BackendPool, Dialer};
use crate::postgres::protocol::{
    backend_error, bind_message, command_complete_tag, execute_message, md5_hash_password,
    parse_message, password_message, password_message_raw, read_message, simple_query,
    startup, sync_message, write_all_flush, affected_rows_from_tag,
};

/// Everything a backend sent in response to one sync point, minus the
/// closing ReadyForQuery.
#[derive(Debug)]
pub struct PgResponse {
    pub messages: Vec<Bytes>,
    pub ready_status: u8,
    pub error: Option<Error>,
}

impl PgResponse {
    /// Rows affected per the last CommandComplete of this response.
    pub fn affected_rows(&self) -> u64 {
        self.messages
            .iter()
            .rev()
            .find_map(|message| command_complete_tag(message))
            .map(|tag| affected_rows_from_tag(&tag))
            .unwrap_or(0)
    }
}

/// One authenticated backend connection.
pub struct PgServer {
    stream: BackendStream,
    label: String,
    /// ParameterStatus and BackendKeyData frames captured during
    /// startup, relayed to clients that authenticate through us.
    pub startup_messages: Vec<Bytes>,
}

impl PgServer {
    /// Dial and authenticate. Cleartext and md5 challenges are
    /// answered with the supplied password.
    pub async fn connect(
        address: &Address,
        username: &str,
        password: &str,
        database: &str,
        connect_timeout: Duration,
        label: &str,
    ) -> Result<PgServer, Error> {
        let mut stream = net::connect(address, connect_timeout).await?;
        startup(&mut stream, username, database).await?;

        let mut startup_messages = Vec::new();
        loop {
            let (code, message) = read_message(&mut stream).await?;
            match code {
                b'R' => {
                    let mut body = &message[5..];
                    if body.remaining() < 4 {
                        return Err(Error::ProtocolSyncError(
                            "truncated authentication message".into(),
                        ));
                    }
                    match body.get_i32() {
                        0 => {} // AuthenticationOk
                        3 => {
                            let reply = password_message(password.as_bytes());
                            write_all_flush(&mut stream, &reply).await?;
                        }
                        5 => {
                            if body.remaining() < 4 {
                                return Err(Error::ProtocolSyncError(
                                    "md5 challenge without salt".into(),
                                ));
                            }
                            let salt = &body[..4];
                            let hashed = md5_hash_password(username, password, salt);
                            let reply = password_message_raw(&hashed);
                            write_all_flush(&mut stream, &reply).await?;
                        }
                        code => {
                            return Err(Error::BackendAuth(format!(
                                "unsupported authentication code {code} from {address}"
                            )));
                        }
                    }
                }
                b'S' | b'K' => startup_messages.push(message.freeze()),
                b'N' => {} // NoticeResponse during startup
                b'E' => {
                    let err = backend_error(&message);
                    return Err(Error::BackendAuth(format!(
                        "authentication rejected by {address}: {err}"
                    )));
                }
                b'Z' => break,
                code => {
                    return Err(Error::ProtocolSyncError(format!(
                        "unexpected message {:?} during backend startup",
                        code as char
                    )));
                }
            }
        }

        debug!("connected to postgres backend {address} ({label}) as {username}");
        Ok(PgServer {
            stream,
            label: label.to_string(),
            startup_messages,
        })
    }

    /// Read messages until ReadyForQuery; the RFQ itself is consumed
    /// and summarized, not collected.
    pub async fn read_until_ready(&mut self) -> Result<PgResponse, Error> {
        let mut messages = Vec::new();
        let mut error = None;
        loop {
            let (code, message) = read_message(&mut self.stream).await?;
            match code {
                b'Z' => {
                    let ready_status = message[5];
                    return Ok(PgResponse {
                        messages,
                        ready_status,
                        error,
                    });
                }
                b'E' => {
                    if error.is_none() {
                        error = Some(backend_error(&message));
                    }
                    messages.push(message.freeze());
                }
                _ => messages.push(message.freeze()),
            }
        }
    }

    /// Send raw client bytes and collect the response window.
    pub async fn forward_raw(&mut self, bytes: &[u8]) -> Result<PgResponse, Error> {
        write_all_flush(&mut self.stream, bytes).await?;
        BACKEND_QUERIES_TOTAL.with_label_values(&[&self.label]).inc();
        self.read_until_ready().await
    }

    /// Run one simple query and collect its response.
    pub async fn simple_query_response(&mut self, text: &str) -> Result<PgResponse, Error> {
        self.forward_raw(&simple_query(text)).await
    }

    /// Run a write via simple query; errors become `Err`.
    pub async fn execute_write(&mut self, text: &str) -> Result<u64, Error> {
        let response = self.simple_query_response(text).await?;
        if let Some(error) = response.error {
            return Err(error);
        }
        Ok(response.affected_rows())
    }

    /// Parse (unnamed), bind, execute, sync; returns affected rows.
    pub async fn extended_write(&mut self, query: &str, raw_params: &[u8]) -> Result<u64, Error> {
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&parse_message("", query));
        buffer.extend_from_slice(&bind_message("", "", raw_params));
        buffer.extend_from_slice(&execute_message(""));
        buffer.extend_from_slice(&sync_message());

        let response = self.forward_raw(&buffer).await?;
        if let Some(error) = response.error {
            return Err(error);
        }
        Ok(response.affected_rows())
    }

    /// Bind and execute the current unnamed statement.
    pub async fn bind_execute(&mut self, raw_params: &[u8]) -> Result<u64, Error> {
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&bind_message("", "", raw_params));
        buffer.extend_from_slice(&execute_message(""));
        buffer.extend_from_slice(&sync_message());

        let response = self.forward_raw(&buffer).await?;
        if let Some(error) = response.error {
            return Err(error);
        }
        Ok(response.affected_rows())
    }

    /// Parse the unnamed statement and wait for ParseComplete.
    pub async fn parse_unnamed(&mut self, query: &str) -> Result<(), Error> {
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&parse_message("", query));
        buffer.extend_from_slice(&sync_message());

        let response = self.forward_raw(&buffer).await?;
        if let Some(error) = response.error {
            return Err(error);
        }
        Ok(())
    }
}

/// Dials primary connections for the batcher's data source.
pub struct PgDialer {
    pub address: Address,
    pub username: String,
    pub password: String,
    pub database: String,
    pub connect_timeout: Duration,
}

impl Dialer for PgDialer {
    type Conn = PgServer;

    async fn dial(&self) -> Result<PgServer, Error> {
        PgServer::connect(
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

/// The write batcher's backend executor for the PostgreSQL dialect.
pub struct PgExecutor {
    pool: BackendPool<PgDialer>,
}

impl PgExecutor {
    pub fn new(dialer: PgDialer, pool_size: usize) -> PgExecutor {
        PgExecutor {
            pool: BackendPool::new(dialer, pool_size),
        }
    }

    async fn run_single(conn: &mut PgServer, item: &BatchItem) -> Result<WriteOutcome, Error> {
        let affected_rows = if item.params.is_empty() {
            conn.execute_write(&item.query).await?
        } else {
            conn.extended_write(&item.query, &item.params).await?
        };
        Ok(WriteOutcome {
            affected_rows,
            // PostgreSQL has no last-insert-id on the wire.
            last_insert_id: 0,
        })
    }

    async fn run_batch(
        conn: &mut PgServer,
        items: &[BatchItem],
    ) -> Result<Vec<WriteOutcome>, Error> {
        conn.execute_write("BEGIN").await?;

        let identical = items
            .windows(2)
            .all(|pair| pair[0].query == pair[1].query);
        let prepared_path = identical && !items[0].params.is_empty();

        let execute = async {
            let mut outcomes = Vec::with_capacity(items.len());
            if prepared_path {
                // Parse once; the unnamed statement survives until the
                // next Parse or simple query, and we issue neither
                // until COMMIT.
                conn.parse_unnamed(&items[0].query).await?;
                for item in items {
                    let affected_rows = conn.bind_execute(&item.params).await?;
                    outcomes.push(WriteOutcome {
                        affected_rows,
                        last_insert_id: 0,
                    });
                }
            } else {
                for item in items {
                    outcomes.push(Self::run_single(conn, item).await?);
                }
            }
            Ok::<Vec<WriteOutcome>, Error>(outcomes)
        };

        match execute.await {
            Ok(outcomes) => {
                conn.execute_write("COMMIT").await?;
                Ok(outcomes)
            }
            Err(error) => {
                if let Err(rollback_error) = conn.execute_write("ROLLBACK").await {
                    warn!("rollback after failed batch also failed: {rollback_error}");
                }
                Err(error)
            }
        }
    }
}

impl BatchExecutor for PgExecutor {
    async fn execute_single(&self, item: &BatchItem) -> Result<WriteOutcome, Error> {
        let (mut conn, permit) = self.pool.get().await?;
        match Self::run_single(&mut conn, item).await {
            Ok(outcome) => {
                self.pool.put(conn);
                drop(permit);
                Ok(outcome)
            }
            Err(error) => {
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
