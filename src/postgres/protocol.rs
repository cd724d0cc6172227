//! PostgreSQL wire codec (protocol 3.0): message framing, one-off
//! message builders, and the parsers the router needs.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::errors::Error;

pub const MAX_MESSAGE_SIZE: i32 = 256 * 1024 * 1024;

/// Protocol version 3.0.
pub const PROTOCOL_VERSION: i32 = 196608;
pub const SSL_REQUEST_CODE: i32 = 80877103;
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

// ---------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------

/// Read one typed message: the code byte plus the complete framed
/// message (code, length, body) ready for relay.
pub async fn read_message<S>(stream: &mut S) -> Result<(u8, BytesMut), Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let code = match stream.read_u8().await {
        Ok(code) => code,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Failed to read message code: {err}"
            )))
        }
    };
    let len = match stream.read_i32().await {
        Ok(len) => len,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Failed to read message length: {err}"
            )))
        }
    };
    if !(4..=MAX_MESSAGE_SIZE).contains(&len) {
        return Err(Error::MaxMessageSize);
    }

    let mut message = BytesMut::with_capacity(len as usize + 1);
    message.put_u8(code);
    message.put_i32(len);
    message.resize(len as usize + 1, 0);
    match stream.read_exact(&mut message[5..]).await {
        Ok(_) => Ok((code, message)),
        Err(err) => Err(Error::SocketError(format!(
            "Failed to read message body: {err}"
        ))),
    }
}

/// The body of a framed message (everything after code and length).
pub fn message_body(message: &[u8]) -> &[u8] {
    &message[5..]
}

pub async fn write_all_flush<S>(stream: &mut S, bytes: &[u8]) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    stream
        .write_all(bytes)
        .await
        .map_err(|err| Error::SocketError(format!("Failed to write to socket: {err}")))?;
    stream
        .flush()
        .await
        .map_err(|err| Error::SocketError(format!("Failed to flush socket: {err}")))
}

// ---------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------

/// Read the untyped startup packet: `(code, parameter bytes)`.
pub async fn read_startup<S>(stream: &mut S) -> Result<(i32, BytesMut), Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let len = stream.read_i32().await.map_err(|err| {
        Error::SocketError(format!("Failed to read startup message length: {err}"))
    })?;
    if !(8..=MAX_MESSAGE_SIZE).contains(&len) {
        return Err(Error::MaxMessageSize);
    }
    let code = stream.read_i32().await.map_err(|err| {
        Error::SocketError(format!("Failed to read startup message code: {err}"))
    })?;

    let mut body = BytesMut::new();
    body.resize(len as usize - 8, 0);
    stream.read_exact(&mut body).await.map_err(|err| {
        Error::SocketError(format!("Failed to read startup message body: {err}"))
    })?;
    Ok((code, body))
}

/// Parse the params the startup message carries as a key/value format.
pub fn parse_startup_params(mut bytes: BytesMut) -> Result<HashMap<String, String>, Error> {
    let mut result = HashMap::new();
    let mut buf = Vec::new();
    let mut tmp = String::new();

    while bytes.has_remaining() {
        let mut c = bytes.get_u8();
        // Null-terminated C-strings.
        while c != 0 {
            tmp.push(c as char);
            if !bytes.has_remaining() {
                break;
            }
            c = bytes.get_u8();
        }
        if !tmp.is_empty() {
            buf.push(tmp.clone());
            tmp.clear();
        }
    }

    if buf.len() % 2 != 0 {
        return Err(Error::ProtocolSyncError(format!(
            "expected key-value startup parameters, got {} strings",
            buf.len()
        )));
    }

    let mut i = 0;
    while i < buf.len() {
        result.insert(buf[i].clone(), buf[i + 1].clone());
        i += 2;
    }

    if !result.contains_key("user") {
        return Err(Error::ProtocolSyncError(
            "startup message without a user parameter".into(),
        ));
    }

    Ok(result)
}

/// Send a startup message to a backend server.
pub async fn startup<S>(stream: &mut S, user: &str, database: &str) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut bytes = BytesMut::new();
    bytes.put_i32(PROTOCOL_VERSION);

    bytes.put(&b"user\0"[..]);
    bytes.put_slice(user.as_bytes());
    bytes.put_u8(0);

    bytes.put(&b"database\0"[..]);
    bytes.put_slice(database.as_bytes());
    bytes.put_u8(0);

    bytes.put(&b"application_name\0"[..]);
    bytes.put_slice(b"tqdbproxy");
    bytes.put_u8(0);
    bytes.put_u8(0);

    let len = bytes.len() as i32 + 4;
    let mut startup = BytesMut::with_capacity(len as usize);
    startup.put_i32(len);
    startup.put(bytes);

    write_all_flush(stream, &startup).await
}

// ---------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------

/// AuthenticationOk.
pub fn auth_ok() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(9);
    bytes.put_u8(b'R');
    bytes.put_i32(8);
    bytes.put_i32(0);
    bytes
}

/// Ask the client for a cleartext password.
pub async fn plain_password_challenge<S>(stream: &mut S) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut res = BytesMut::new();
    res.put_u8(b'R');
    res.put_i32(8);
    res.put_i32(3); // Plain password
    write_all_flush(stream, &res).await
}

/// Read a password message from the client, without its trailing NUL.
pub async fn read_password<S>(stream: &mut S) -> Result<Vec<u8>, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let (code, message) = read_message(stream).await?;
    if code != b'p' {
        return Err(Error::ProtocolSyncError(format!(
            "expected password message (p), received {:?}",
            code as char
        )));
    }
    let mut password = message_body(&message).to_vec();
    if password.last() == Some(&0) {
        password.pop();
    }
    Ok(password)
}

/// Create the md5 password hash for a backend challenge.
pub fn md5_hash_password(user: &str, password: &str, salt: &[u8]) -> Vec<u8> {
    let mut md5 = Md5::new();
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());
    let first_pass = format!("{:x}", md5.finalize_reset());

    md5.update(&first_pass);
    md5.update(salt);
    let mut hashed = format!("md5{:x}", md5.finalize())
        .into_bytes();
    hashed.push(0);
    hashed
}

/// Password message toward a backend.
pub fn password_message(password: &[u8]) -> BytesMut {
    let mut message = BytesMut::with_capacity(password.len() + 6);
    message.put_u8(b'p');
    message.put_i32(4 + password.len() as i32 + 1);
    message.put_slice(password);
    message.put_u8(0);
    message
}

/// Password message carrying pre-terminated bytes (md5 hashes carry
/// their own NUL).
pub fn password_message_raw(password: &[u8]) -> BytesMut {
    let mut message = BytesMut::with_capacity(password.len() + 5);
    message.put_u8(b'p');
    message.put_i32(4 + password.len() as i32);
    message.put_slice(password);
    message
}

/// The fatal authentication failure packet.
pub async fn wrong_password<S>(stream: &mut S, user: &str) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut error = BytesMut::new();
    error.put_u8(b'S');
    error.put_slice(&b"FATAL\0"[..]);
    error.put_u8(b'V');
    error.put_slice(&b"FATAL\0"[..]);
    error.put_u8(b'C');
    error.put_slice(&b"28P01\0"[..]);
    error.put_u8(b'M');
    error.put_slice(format!("password authentication failed for user \"{user}\"\0").as_bytes());
    error.put_u8(0);

    let mut res = BytesMut::new();
    res.put_u8(b'E');
    res.put_i32(error.len() as i32 + 4);
    res.put(error);
    write_all_flush(stream, &res).await
}

// ---------------------------------------------------------------------
// One-off messages
// ---------------------------------------------------------------------

/// Create a simple query message.
pub fn simple_query(query: &str) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'Q');
    bytes.put_i32(4 + query.len() as i32 + 1);
    bytes.put_slice(query.as_bytes());
    bytes.put_u8(0);
    bytes
}

/// Create a command complete message.
pub fn command_complete(command: &str) -> BytesMut {
    let mut res = BytesMut::new();
    res.put_u8(b'C');
    res.put_i32(command.len() as i32 + 4 + 1);
    res.put_slice(command.as_bytes());
    res.put_u8(0);
    res
}

/// Create a ready for query message.
pub fn ready_for_query(status: u8) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'Z');
    bytes.put_i32(5);
    bytes.put_u8(status);
    bytes
}

/// Create a parse complete message.
pub fn parse_complete() -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'1');
    bytes.put_i32(4);
    bytes
}

/// Create a bind complete message.
pub fn bind_complete() -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'2');
    bytes.put_i32(4);
    bytes
}

/// Create a row description message with text columns.
pub fn row_description(columns: &[&str]) -> BytesMut {
    let mut res = BytesMut::new();
    let mut row_desc = BytesMut::new();

    row_desc.put_i16(columns.len() as i16);
    for name in columns {
        row_desc.put_slice(format!("{name}\0").as_bytes());
        row_desc.put_i32(0); // table oid
        row_desc.put_i16(0); // column attr
        row_desc.put_i32(25); // text
        row_desc.put_i16(-1); // variable size
        row_desc.put_i32(-1); // type modifier
        row_desc.put_i16(0); // text format
    }

    res.put_u8(b'T');
    res.put_i32(row_desc.len() as i32 + 4);
    res.put(row_desc);
    res
}

/// Create a data row message.
pub fn data_row(row: &[&str]) -> BytesMut {
    let mut res = BytesMut::new();
    let mut data_row = BytesMut::new();

    data_row.put_i16(row.len() as i16);
    for value in row {
        data_row.put_i32(value.len() as i32);
        data_row.put_slice(value.as_bytes());
    }

    res.put_u8(b'D');
    res.put_i32(data_row.len() as i32 + 4);
    res.put(data_row);
    res
}

/// Create an error response message (severity ERROR; the connection
/// survives).
pub fn error_response(message: &str, code: &str) -> BytesMut {
    let mut error = BytesMut::new();
    error.put_u8(b'S');
    error.put_slice(&b"ERROR\0"[..]);
    error.put_u8(b'V');
    error.put_slice(&b"ERROR\0"[..]);
    error.put_u8(b'C');
    error.put_slice(format!("{code}\0").as_bytes());
    error.put_u8(b'M');
    error.put_slice(format!("{message}\0").as_bytes());
    error.put_u8(0);

    let mut res = BytesMut::with_capacity(error.len() + 5);
    res.put_u8(b'E');
    res.put_i32(error.len() as i32 + 4);
    res.put(error);
    res
}

/// Create a Parse message.
pub fn parse_message(name: &str, query: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_slice(name.as_bytes());
    body.put_u8(0);
    body.put_slice(query.as_bytes());
    body.put_u8(0);
    body.put_i16(0); // no parameter type hints

    let mut res = BytesMut::with_capacity(body.len() + 5);
    res.put_u8(b'P');
    res.put_i32(body.len() as i32 + 4);
    res.put(body);
    res
}

/// Create a Bind message from a raw parameter section (format codes,
/// parameter values, result formats) captured from a client's Bind.
pub fn bind_message(portal: &str, statement: &str, raw_params: &[u8]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_slice(portal.as_bytes());
    body.put_u8(0);
    body.put_slice(statement.as_bytes());
    body.put_u8(0);
    body.put_slice(raw_params);

    let mut res = BytesMut::with_capacity(body.len() + 5);
    res.put_u8(b'B');
    res.put_i32(body.len() as i32 + 4);
    res.put(body);
    res
}

/// Create an Execute message (no row limit).
pub fn execute_message(portal: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_slice(portal.as_bytes());
    body.put_u8(0);
    body.put_i32(0);

    let mut res = BytesMut::with_capacity(body.len() + 5);
    res.put_u8(b'E');
    res.put_i32(body.len() as i32 + 4);
    res.put(body);
    res
}

/// Create a sync message.
pub fn sync_message() -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'S');
    bytes.put_i32(4);
    bytes
}

// ---------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------

/// The tag of a CommandComplete message.
pub fn command_complete_tag(message: &[u8]) -> Option<String> {
    if message.first() != Some(&b'C') {
        return None;
    }
    let body = message_body(message);
    let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
    Some(String::from_utf8_lossy(&body[..end]).to_string())
}

/// Rows affected per a CommandComplete tag: `INSERT 0 5`, `UPDATE 3`,
/// `DELETE 3`.
pub fn affected_rows_from_tag(tag: &str) -> u64 {
    tag.rsplit(' ')
        .next()
        .and_then(|count| count.parse::<u64>().ok())
        .unwrap_or(0)
}

/// The CommandComplete tag for a synthesized write reply.
pub fn write_tag(kind: crate::hints::StatementKind, affected_rows: u64) -> String {
    match kind {
        crate::hints::StatementKind::Insert => format!("INSERT 0 {affected_rows}"),
        crate::hints::StatementKind::Update => format!("UPDATE {affected_rows}"),
        crate::hints::StatementKind::Delete => format!("DELETE {affected_rows}"),
        _ => format!("OK {affected_rows}"),
    }
}

/// The `C` (SQLSTATE) and `M` (message) fields of an ErrorResponse.
pub fn parse_error_fields(message: &[u8]) -> (String, String) {
    let mut code = String::from("XX000");
    let mut text = String::new();

    let mut body = message_body(message);
    while body.has_remaining() {
        let field = body.get_u8();
        if field == 0 {
            break;
        }
        let end = body
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(body.remaining());
        let value = String::from_utf8_lossy(&body[..end]).to_string();
        body.advance((end + 1).min(body.remaining()));
        match field {
            b'C' => code = value,
            b'M' => text = value,
            _ => {}
        }
    }

    (code, text)
}

/// Map a backend ErrorResponse to the proxy's error type, stripped of
/// any driver prefix.
pub fn backend_error(message: &[u8]) -> Error {
    let (code, text) = parse_error_fields(message);
    Error::BackendQuery {
        code,
        message: text,
    }
}

/// Re-serialize a proxy error as a client-facing ErrorResponse.
pub fn error_for_client(error: &Error) -> BytesMut {
    match error {
        Error::BackendQuery { code, message } => error_response(message, code),
        other => error_response(&other.to_string(), "XX000"),
    }
}

/// The query text of a client Parse message: `(statement_name, query)`.
pub fn parse_parse_message(message: &[u8]) -> Result<(String, String), Error> {
    let body = message_body(message);
    let mut parts = body.split(|b| *b == 0);
    let name = parts
        .next()
        .map(|raw| String::from_utf8_lossy(raw).to_string())
        .ok_or_else(|| Error::ProtocolSyncError("malformed Parse message".into()))?;
    let query = parts
        .next()
        .map(|raw| String::from_utf8_lossy(raw).to_string())
        .ok_or_else(|| Error::ProtocolSyncError("malformed Parse message".into()))?;
    Ok((name, query))
}

/// Split a client Bind message into `(portal, statement, raw parameter
/// section)`.
pub fn parse_bind_message(message: &[u8]) -> Result<(String, String, Bytes), Error> {
    let body = message_body(message);
    let first_nul = body
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::ProtocolSyncError("malformed Bind message".into()))?;
    let portal = String::from_utf8_lossy(&body[..first_nul]).to_string();
    let rest = &body[first_nul + 1..];
    let second_nul = rest
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::ProtocolSyncError("malformed Bind message".into()))?;
    let statement = String::from_utf8_lossy(&rest[..second_nul]).to_string();
    let raw_params = Bytes::copy_from_slice(&rest[second_nul + 1..]);
    Ok((portal, statement, raw_params))
}

/// The portal name of a client Execute message.
pub fn parse_execute_message(message: &[u8]) -> Result<String, Error> {
    let body = message_body(message);
    let nul = body
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::ProtocolSyncError("malformed Execute message".into()))?;
    Ok(String::from_utf8_lossy(&body[..nul]).to_string())
}
