//! MySQL wire codec: packet framing, length-encoded primitives,
//! OK/ERR/EOF construction and parsing, handshake payloads, and
//! response framing for the text and binary protocols.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::errors::Error;
use crate::mysql::constants::*;

/// Upper bound on one logical payload.
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

// ---------------------------------------------------------------------
// Packet framing
// ---------------------------------------------------------------------

/// Read one logical packet: returns the sequence id of its first frame
/// and the reassembled payload.
pub async fn read_packet<S>(stream: &mut S) -> Result<(u8, BytesMut), Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let mut payload = BytesMut::new();
    let mut first_seq = None;

    loop {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.map_err(|err| {
            Error::SocketError(format!("Failed to read packet header: {err}"))
        })?;

        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        let seq = header[3];
        if first_seq.is_none() {
            first_seq = Some(seq);
        }

        if payload.len() + len > MAX_MESSAGE_SIZE {
            return Err(Error::MaxMessageSize);
        }

        let start = payload.len();
        payload.resize(start + len, 0);
        stream
            .read_exact(&mut payload[start..])
            .await
            .map_err(|err| Error::SocketError(format!("Failed to read packet body: {err}")))?;

        // A maximum-size frame is continued in the next one.
        if len < MAX_PACKET_SIZE {
            break;
        }
    }

    Ok((first_seq.unwrap_or(0), payload))
}

/// Write one logical packet, splitting at the frame size limit.
pub async fn write_packet<S>(stream: &mut S, mut seq: u8, payload: &[u8]) -> Result<u8, Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut rest = payload;
    loop {
        let chunk = rest.len().min(MAX_PACKET_SIZE);
        let mut header = [0u8; 4];
        header[..3].copy_from_slice(&(chunk as u32).to_le_bytes()[..3]);
        header[3] = seq;
        seq = seq.wrapping_add(1);

        stream
            .write_all(&header)
            .await
            .map_err(|err| Error::SocketError(format!("Failed to write packet header: {err}")))?;
        stream
            .write_all(&rest[..chunk])
            .await
            .map_err(|err| Error::SocketError(format!("Failed to write packet body: {err}")))?;

        rest = &rest[chunk..];
        if rest.is_empty() && chunk < MAX_PACKET_SIZE {
            break;
        }
        if rest.is_empty() && chunk == MAX_PACKET_SIZE {
            // Terminating empty frame after an exact multiple.
            let mut header = [0u8; 4];
            header[3] = seq;
            seq = seq.wrapping_add(1);
            stream.write_all(&header).await.map_err(|err| {
                Error::SocketError(format!("Failed to write packet header: {err}"))
            })?;
            break;
        }
    }

    stream
        .flush()
        .await
        .map_err(|err| Error::SocketError(format!("Failed to flush socket: {err}")))?;
    Ok(seq)
}

/// Write a list of payloads with consecutive sequence ids; returns the
/// next sequence id.
pub async fn write_payloads<S>(
    stream: &mut S,
    start_seq: u8,
    payloads: &[Bytes],
) -> Result<u8, Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut seq = start_seq;
    for payload in payloads {
        seq = write_packet(stream, seq, payload).await?;
    }
    Ok(seq)
}

/// Frame a list of payloads into one buffer, sequence ids starting at
/// `start_seq`. Used to build the replayable bytes a cache entry holds.
pub fn frame_payloads(payloads: &[Bytes], start_seq: u8) -> Bytes {
    let mut framed = BytesMut::new();
    let mut seq = start_seq;
    for payload in payloads {
        debug_assert!(payload.len() < MAX_PACKET_SIZE);
        framed.put_slice(&(payload.len() as u32).to_le_bytes()[..3]);
        framed.put_u8(seq);
        seq = seq.wrapping_add(1);
        framed.put_slice(payload);
    }
    framed.freeze()
}

// ---------------------------------------------------------------------
// Length-encoded primitives
// ---------------------------------------------------------------------

pub fn read_lenenc_int(buf: &mut impl Buf) -> Result<u64, Error> {
    if !buf.has_remaining() {
        return Err(Error::ProtocolSyncError(
            "truncated length-encoded integer".into(),
        ));
    }
    let first = buf.get_u8();
    let needed = match first {
        0xfc => 2,
        0xfd => 3,
        0xfe => 8,
        0xfb => {
            return Err(Error::ProtocolSyncError(
                "NULL is not a valid integer here".into(),
            ))
        }
        value => return Ok(value as u64),
    };
    if buf.remaining() < needed {
        return Err(Error::ProtocolSyncError(
            "truncated length-encoded integer".into(),
        ));
    }
    let mut value = 0u64;
    for shift in 0..needed {
        value |= (buf.get_u8() as u64) << (8 * shift);
    }
    Ok(value)
}

pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    match value {
        0..=0xfa => buf.put_u8(value as u8),
        0xfb..=0xffff => {
            buf.put_u8(0xfc);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xff_ffff => {
            buf.put_u8(0xfd);
            buf.put_slice(&(value as u32).to_le_bytes()[..3]);
        }
        _ => {
            buf.put_u8(0xfe);
            buf.put_u64_le(value);
        }
    }
}

pub fn put_lenenc_str(buf: &mut BytesMut, value: &[u8]) {
    put_lenenc_int(buf, value.len() as u64);
    buf.put_slice(value);
}

fn read_nul_str(buf: &mut BytesMut) -> Result<String, Error> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::ProtocolSyncError("string is not nul-terminated".into()))?;
    let raw = buf.split_to(end);
    buf.advance(1);
    String::from_utf8(raw.to_vec())
        .map_err(|_| Error::ProtocolSyncError("invalid utf-8 in protocol string".into()))
}

// ---------------------------------------------------------------------
// OK / ERR / EOF
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OkData {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: u16,
    pub warnings: u16,
}

/// Build an OK payload (PROTOCOL_41 layout).
pub fn ok_payload(affected_rows: u64, last_insert_id: u64, status: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u8(OK_HEADER);
    put_lenenc_int(&mut buf, affected_rows);
    put_lenenc_int(&mut buf, last_insert_id);
    buf.put_u16_le(status);
    buf.put_u16_le(0); // warnings
    buf.freeze()
}

/// Parse an OK payload (header 0x00, or 0xfe under DEPRECATE_EOF).
pub fn parse_ok(payload: &[u8]) -> Result<OkData, Error> {
    let mut buf = &payload[1..];
    let affected_rows = read_lenenc_int(&mut buf)?;
    let last_insert_id = read_lenenc_int(&mut buf)?;
    if buf.remaining() < 4 {
        return Err(Error::ProtocolSyncError("truncated OK packet".into()));
    }
    let status = buf.get_u16_le();
    let warnings = buf.get_u16_le();
    Ok(OkData {
        affected_rows,
        last_insert_id,
        status,
        warnings,
    })
}

/// Build an ERR payload.
pub fn err_payload(code: u16, sql_state: &str, message: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(message.len() + 16);
    buf.put_u8(ERR_HEADER);
    buf.put_u16_le(code);
    buf.put_u8(b'#');
    let mut state = [b'H', b'Y', b'0', b'0', b'0'];
    for (slot, byte) in state.iter_mut().zip(sql_state.bytes()) {
        *slot = byte;
    }
    buf.put_slice(&state);
    buf.put_slice(message.as_bytes());
    buf.freeze()
}

/// Parse an ERR payload into a backend error.
pub fn parse_err(payload: &[u8]) -> Error {
    let mut buf = &payload[1..];
    if buf.remaining() < 2 {
        return Error::ProtocolSyncError("truncated ERR packet".into());
    }
    let code = buf.get_u16_le();
    let mut state = String::from("HY000");
    if buf.remaining() >= 6 && buf[0] == b'#' {
        state = String::from_utf8_lossy(&buf[1..6]).to_string();
        buf.advance(6);
    }
    let message = String::from_utf8_lossy(buf).to_string();
    Error::BackendQuery {
        code: format!("{code} ({state})"),
        message,
    }
}

/// The numeric code and message of a backend error, for re-serializing
/// it toward the client.
pub fn backend_error_parts(error: &Error) -> (u16, String, String) {
    match error {
        Error::BackendQuery { code, message } => {
            let numeric = code
                .split_whitespace()
                .next()
                .and_then(|c| c.parse::<u16>().ok())
                .unwrap_or(1105);
            let state = code
                .split(['(', ')'])
                .nth(1)
                .unwrap_or("HY000")
                .to_string();
            (numeric, state, message.clone())
        }
        other => (1105, "HY000".to_string(), other.to_string()),
    }
}

/// Build an EOF payload.
pub fn eof_payload(status: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(EOF_HEADER);
    buf.put_u16_le(0); // warnings
    buf.put_u16_le(status);
    buf.freeze()
}

/// True when a payload is the terminator of a row stream: an EOF, or an
/// OK with EOF header under DEPRECATE_EOF. Data rows can also start
/// with 0xfe when a length-encoded field is 8 bytes; the length check
/// tells them apart.
pub fn is_terminator(payload: &[u8], deprecate_eof: bool) -> bool {
    if payload.is_empty() || payload[0] != EOF_HEADER {
        return false;
    }
    if deprecate_eof {
        payload.len() < MAX_PACKET_SIZE
    } else {
        payload.len() < 9
    }
}

/// Status flags of a row stream terminator: an OK-shaped packet under
/// DEPRECATE_EOF, a plain EOF otherwise.
pub fn terminator_status(payload: &[u8], deprecate_eof: bool) -> Result<u16, Error> {
    if deprecate_eof {
        Ok(parse_ok(payload)?.status)
    } else if payload.len() >= 5 {
        Ok(u16::from_le_bytes([payload[3], payload[4]]))
    } else {
        Err(Error::ProtocolSyncError("truncated EOF packet".into()))
    }
}

/// Rewrite the status flags of a response's final packet to set or
/// clear the more-results bit, for multi-statement replies.
pub fn patch_more_results(payloads: &mut [Bytes], more: bool) {
    let Some(last) = payloads.last_mut() else {
        return;
    };
    if last.is_empty() || last[0] == ERR_HEADER {
        return;
    }

    let mut raw = last.to_vec();
    let status_offset = if raw[0] == OK_HEADER || (raw[0] == EOF_HEADER && raw.len() >= 9) {
        // OK layout: header + two length-encoded integers.
        let mut buf = &raw[1..];
        let before = buf.remaining();
        if read_lenenc_int(&mut buf).is_err() || read_lenenc_int(&mut buf).is_err() {
            return;
        }
        1 + (before - buf.remaining())
    } else if raw[0] == EOF_HEADER && raw.len() >= 5 {
        3
    } else {
        return;
    };

    if raw.len() < status_offset + 2 {
        return;
    }
    let mut status = u16::from_le_bytes([raw[status_offset], raw[status_offset + 1]]);
    if more {
        status |= SERVER_MORE_RESULTS_EXISTS;
    } else {
        status &= !SERVER_MORE_RESULTS_EXISTS;
    }
    raw[status_offset..status_offset + 2].copy_from_slice(&status.to_le_bytes());
    *last = Bytes::from(raw);
}

// ---------------------------------------------------------------------
// Result sets
// ---------------------------------------------------------------------

/// Column definition payload for a synthetic text result set.
pub fn column_def_payload(name: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(name.len() + 32);
    put_lenenc_str(&mut buf, b"def"); // catalog
    put_lenenc_str(&mut buf, b""); // schema
    put_lenenc_str(&mut buf, b""); // table
    put_lenenc_str(&mut buf, b""); // org_table
    put_lenenc_str(&mut buf, name.as_bytes());
    put_lenenc_str(&mut buf, b""); // org_name
    buf.put_u8(0x0c); // fixed-length fields
    buf.put_u16_le(UTF8MB4_GENERAL_CI as u16);
    buf.put_u32_le(255); // column length
    buf.put_u8(MYSQL_TYPE_VAR_STRING);
    buf.put_u16_le(0); // flags
    buf.put_u8(0); // decimals
    buf.put_u16_le(0); // filler
    buf.freeze()
}

/// Text protocol row payload.
pub fn text_row_payload(values: &[&str]) -> Bytes {
    let mut buf = BytesMut::new();
    for value in values {
        put_lenenc_str(&mut buf, value.as_bytes());
    }
    buf.freeze()
}

/// Build the payload list of a complete text result set.
pub fn result_set_payloads(
    columns: &[&str],
    rows: &[Vec<String>],
    deprecate_eof: bool,
    status: u16,
) -> Vec<Bytes> {
    let mut payloads = Vec::with_capacity(columns.len() + rows.len() + 3);

    let mut count = BytesMut::new();
    put_lenenc_int(&mut count, columns.len() as u64);
    payloads.push(count.freeze());

    for column in columns {
        payloads.push(column_def_payload(column));
    }
    if !deprecate_eof {
        payloads.push(eof_payload(status));
    }
    for row in rows {
        let values: Vec<&str> = row.iter().map(|v| v.as_str()).collect();
        payloads.push(text_row_payload(&values));
    }
    if deprecate_eof {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(EOF_HEADER);
        put_lenenc_int(&mut buf, 0);
        put_lenenc_int(&mut buf, 0);
        buf.put_u16_le(status);
        buf.put_u16_le(0);
        payloads.push(buf.freeze());
    } else {
        payloads.push(eof_payload(status));
    }

    payloads
}

// ---------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub server_version: String,
    pub capabilities: u32,
    pub auth_data: Vec<u8>,
    pub auth_plugin: String,
}

/// Parse a protocol version 10 initial handshake payload.
pub fn parse_initial_handshake(payload: &[u8]) -> Result<InitialHandshake, Error> {
    let mut buf = BytesMut::from(payload);
    if buf.is_empty() || buf[0] != PROTOCOL_VERSION {
        return Err(Error::ProtocolSyncError(format!(
            "unsupported handshake protocol version {}",
            buf.first().copied().unwrap_or(0)
        )));
    }
    buf.advance(1);
    let server_version = read_nul_str(&mut buf)?;
    if buf.remaining() < 4 + 8 + 1 + 2 {
        return Err(Error::ProtocolSyncError("truncated handshake".into()));
    }
    buf.advance(4); // thread id
    let mut auth_data = buf.split_to(8).to_vec();
    buf.advance(1); // filler
    let cap_low = buf.get_u16_le() as u32;

    let mut capabilities = cap_low;
    let mut auth_plugin = String::new();
    if buf.remaining() >= 1 + 2 + 2 + 1 + 10 {
        buf.advance(1); // charset
        buf.advance(2); // status
        let cap_high = buf.get_u16_le() as u32;
        capabilities |= cap_high << 16;
        let auth_len = buf.get_u8() as usize;
        buf.advance(10); // reserved
        if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let tail_len = auth_len.saturating_sub(8).max(13);
            if buf.remaining() < tail_len {
                return Err(Error::ProtocolSyncError("truncated handshake".into()));
            }
            let tail = buf.split_to(tail_len);
            // The trailing NUL is not part of the nonce.
            let keep = tail_len.saturating_sub(1);
            auth_data.extend_from_slice(&tail[..keep]);
        }
        if capabilities & CLIENT_PLUGIN_AUTH != 0 {
            auth_plugin = read_nul_str(&mut buf).unwrap_or_default();
        }
    }

    Ok(InitialHandshake {
        server_version,
        capabilities,
        auth_data,
        auth_plugin,
    })
}

/// Clear the CLIENT_SSL bit of a relayed initial handshake so clients
/// never attempt TLS with the proxy, which does not offer it.
pub fn strip_ssl_capability(payload: &[u8]) -> Result<Bytes, Error> {
    let nul = payload[1..]
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::ProtocolSyncError("malformed handshake".into()))?;
    // version byte + server version string + NUL + thread id + nonce
    // part 1 + filler.
    let cap_low_offset = 1 + nul + 1 + 4 + 8 + 1;
    if payload.len() < cap_low_offset + 2 {
        return Err(Error::ProtocolSyncError("truncated handshake".into()));
    }
    let mut raw = payload.to_vec();
    let mut cap_low = u16::from_le_bytes([raw[cap_low_offset], raw[cap_low_offset + 1]]);
    cap_low &= !(CLIENT_SSL as u16);
    raw[cap_low_offset..cap_low_offset + 2].copy_from_slice(&cap_low.to_le_bytes());
    Ok(Bytes::from(raw))
}

#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capabilities: u32,
    pub username: String,
    pub database: Option<String>,
}

/// Parse the client's HandshakeResponse41 far enough to learn its
/// capability flags, username, and selected database.
pub fn parse_handshake_response(payload: &[u8]) -> Result<HandshakeResponse, Error> {
    let mut buf = BytesMut::from(payload);
    if buf.remaining() < 4 + 4 + 1 + 23 {
        return Err(Error::ProtocolSyncError("truncated handshake response".into()));
    }
    let capabilities = buf.get_u32_le();
    if capabilities & CLIENT_PROTOCOL_41 == 0 {
        return Err(Error::ProtocolSyncError(
            "client does not speak protocol 4.1".into(),
        ));
    }
    buf.advance(4); // max packet size
    buf.advance(1); // charset
    buf.advance(23); // reserved

    let username = read_nul_str(&mut buf)?;

    // Auth response.
    if capabilities & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        let len = read_lenenc_int(&mut buf)? as usize;
        if buf.remaining() < len {
            return Err(Error::ProtocolSyncError("truncated auth data".into()));
        }
        buf.advance(len);
    } else if capabilities & CLIENT_SECURE_CONNECTION != 0 {
        if !buf.has_remaining() {
            return Err(Error::ProtocolSyncError("truncated auth data".into()));
        }
        let len = buf.get_u8() as usize;
        if buf.remaining() < len {
            return Err(Error::ProtocolSyncError("truncated auth data".into()));
        }
        buf.advance(len);
    } else {
        read_nul_str(&mut buf)?;
    }

    let database = if capabilities & CLIENT_CONNECT_WITH_DB != 0 && buf.has_remaining() {
        Some(read_nul_str(&mut buf)?)
    } else {
        None
    };

    Ok(HandshakeResponse {
        capabilities,
        username,
        database,
    })
}

/// `mysql_native_password`: SHA1(password) XOR SHA1(nonce + SHA1(SHA1(password))).
pub fn native_password_scramble(password: &str, nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut salted = Sha1::new();
    salted.update(&nonce[..nonce.len().min(20)]);
    salted.update(stage2);
    let salted = salted.finalize();

    stage1
        .iter()
        .zip(salted.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Build the HandshakeResponse41 payload for a proxy-owned connection.
pub fn handshake_response_payload(
    capabilities: u32,
    username: &str,
    scramble: &[u8],
    database: &str,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(64 + username.len() + database.len());
    buf.put_u32_le(capabilities);
    buf.put_u32_le(MAX_MESSAGE_SIZE as u32);
    buf.put_u8(UTF8MB4_GENERAL_CI);
    buf.put_bytes(0, 23);
    buf.put_slice(username.as_bytes());
    buf.put_u8(0);
    buf.put_u8(scramble.len() as u8);
    buf.put_slice(scramble);
    if capabilities & CLIENT_CONNECT_WITH_DB != 0 {
        buf.put_slice(database.as_bytes());
        buf.put_u8(0);
    }
    if capabilities & CLIENT_PLUGIN_AUTH != 0 {
        buf.put_slice(NATIVE_PASSWORD_PLUGIN.as_bytes());
        buf.put_u8(0);
    }
    buf.freeze()
}

// ---------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------

pub fn com_query(text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(text.len() + 1);
    buf.put_u8(COM_QUERY);
    buf.put_slice(text.as_bytes());
    buf.freeze()
}

pub fn com_init_db(database: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(database.len() + 1);
    buf.put_u8(COM_INIT_DB);
    buf.put_slice(database.as_bytes());
    buf.freeze()
}

pub fn com_stmt_prepare(text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(text.len() + 1);
    buf.put_u8(COM_STMT_PREPARE);
    buf.put_slice(text.as_bytes());
    buf.freeze()
}

pub fn com_stmt_close(statement_id: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(COM_STMT_CLOSE);
    buf.put_u32_le(statement_id);
    buf.freeze()
}

/// Build a COM_STMT_EXECUTE payload from a statement id and the raw
/// tail (null bitmap, new-params-bound flag, types, values).
pub fn com_stmt_execute(statement_id: u32, tail: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(10 + tail.len());
    buf.put_u8(COM_STMT_EXECUTE);
    buf.put_u32_le(statement_id);
    buf.put_u8(0); // flags: CURSOR_TYPE_NO_CURSOR
    buf.put_u32_le(1); // iteration count
    buf.put_slice(tail);
    buf.freeze()
}

/// Split a client COM_STMT_EXECUTE payload into its statement id and
/// raw tail.
pub fn split_stmt_execute(payload: &[u8]) -> Result<(u32, Bytes), Error> {
    if payload.len() < 10 {
        return Err(Error::ProtocolSyncError(
            "truncated COM_STMT_EXECUTE".into(),
        ));
    }
    let statement_id = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
    Ok((statement_id, Bytes::copy_from_slice(&payload[10..])))
}

/// Normalize an execute tail so it always carries its parameter types
/// (new-params-bound = 1), caching or reusing types as needed. Returns
/// the normalized tail and, when the client sent types, a copy to cache
/// for later executes on the same statement.
pub fn normalize_execute_tail(
    tail: &Bytes,
    num_params: u16,
    cached_types: Option<&Bytes>,
) -> Result<(Bytes, Option<Bytes>), Error> {
    if num_params == 0 {
        return Ok((tail.clone(), None));
    }

    let bitmap_len = (num_params as usize + 7) / 8;
    if tail.len() < bitmap_len + 1 {
        return Err(Error::ProtocolSyncError(
            "truncated COM_STMT_EXECUTE parameters".into(),
        ));
    }

    let new_params_bound = tail[bitmap_len];
    if new_params_bound == 1 {
        let types_end = bitmap_len + 1 + 2 * num_params as usize;
        if tail.len() < types_end {
            return Err(Error::ProtocolSyncError(
                "truncated COM_STMT_EXECUTE types".into(),
            ));
        }
        let types = tail.slice(bitmap_len + 1..types_end);
        return Ok((tail.clone(), Some(types)));
    }

    // Types were bound by an earlier execute; splice the cached ones
    // back in so the batcher's backend can replay this tail verbatim.
    let types = cached_types.ok_or_else(|| {
        Error::ProtocolSyncError("execute without bound parameter types".into())
    })?;
    let mut rebuilt = BytesMut::with_capacity(tail.len() + types.len());
    rebuilt.put_slice(&tail[..bitmap_len]);
    rebuilt.put_u8(1);
    rebuilt.put_slice(types);
    rebuilt.put_slice(&tail[bitmap_len + 1..]);
    Ok((rebuilt.freeze(), None))
}

// ---------------------------------------------------------------------
// Response framing
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    Ok(OkData),
    Error,
    ResultSet { status: u16 },
}

/// One complete response to a command: the payload list to relay and a
/// summary of how it ended.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub payloads: Vec<Bytes>,
    pub kind: ResponseKind,
}

impl QueryResponse {
    pub fn status(&self) -> u16 {
        match self.kind {
            ResponseKind::Ok(ok) => ok.status,
            ResponseKind::ResultSet { status } => status,
            ResponseKind::Error => 0,
        }
    }

    pub fn more_results(&self) -> bool {
        self.status() & SERVER_MORE_RESULTS_EXISTS != 0
    }

    pub fn is_error(&self) -> bool {
        self.kind == ResponseKind::Error
    }

    /// The error this response carries, if any. The ERR packet is the
    /// first packet of a failed command, or the last one of a result
    /// set that failed mid-stream.
    pub fn error(&self) -> Option<Error> {
        if !self.is_error() {
            return None;
        }
        self.payloads
            .iter()
            .rev()
            .find(|payload| payload.first() == Some(&ERR_HEADER))
            .map(|payload| parse_err(payload))
    }
}

/// Read one result of a command response (text protocol framing; the
/// binary protocol frames rows identically for our purposes).
pub async fn read_query_response<S>(
    stream: &mut S,
    capabilities: u32,
) -> Result<QueryResponse, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let deprecate_eof = capabilities & CLIENT_DEPRECATE_EOF != 0;
    let (_, first) = read_packet(stream).await?;

    match first.first().copied() {
        Some(OK_HEADER) => {
            let ok = parse_ok(&first)?;
            Ok(QueryResponse {
                payloads: vec![first.freeze()],
                kind: ResponseKind::Ok(ok),
            })
        }
        Some(ERR_HEADER) => Ok(QueryResponse {
            payloads: vec![first.freeze()],
            kind: ResponseKind::Error,
        }),
        Some(LOCAL_INFILE_HEADER) => Err(Error::ProtocolSyncError(
            "LOCAL INFILE is not supported through the proxy".into(),
        )),
        Some(_) => {
            let mut payloads = vec![first.clone().freeze()];
            let mut count_buf = &first[..];
            let column_count = read_lenenc_int(&mut count_buf)? as usize;

            for _ in 0..column_count {
                let (_, column) = read_packet(stream).await?;
                payloads.push(column.freeze());
            }
            if !deprecate_eof {
                let (_, eof) = read_packet(stream).await?;
                payloads.push(eof.freeze());
            }

            // Rows until the terminator.
            let status = loop {
                let (_, row) = read_packet(stream).await?;
                if is_terminator(&row, deprecate_eof) {
                    let status = terminator_status(&row, deprecate_eof)?;
                    payloads.push(row.freeze());
                    break status;
                }
                if row.first() == Some(&ERR_HEADER) {
                    payloads.push(row.freeze());
                    return Ok(QueryResponse {
                        payloads,
                        kind: ResponseKind::Error,
                    });
                }
                payloads.push(row.freeze());
            };

            Ok(QueryResponse {
                payloads,
                kind: ResponseKind::ResultSet { status },
            })
        }
        None => Err(Error::ProtocolSyncError("empty response packet".into())),
    }
}

/// Read every result of a response, following the more-results chain.
pub async fn read_full_response<S>(
    stream: &mut S,
    capabilities: u32,
) -> Result<QueryResponse, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let mut response = read_query_response(stream, capabilities).await?;
    while response.more_results() {
        let next = read_query_response(stream, capabilities).await?;
        response.payloads.extend(next.payloads);
        response.kind = next.kind;
    }
    Ok(response)
}

// ---------------------------------------------------------------------
// Prepared statements
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareOk {
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
}

pub fn parse_prepare_ok(payload: &[u8]) -> Result<PrepareOk, Error> {
    if payload.len() < 12 || payload[0] != OK_HEADER {
        return Err(Error::ProtocolSyncError(
            "malformed COM_STMT_PREPARE response".into(),
        ));
    }
    Ok(PrepareOk {
        statement_id: u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]),
        num_columns: u16::from_le_bytes([payload[5], payload[6]]),
        num_params: u16::from_le_bytes([payload[7], payload[8]]),
    })
}

/// Read a full COM_STMT_PREPARE response, returning its summary and
/// every payload for relay.
pub async fn read_prepare_response<S>(
    stream: &mut S,
    capabilities: u32,
) -> Result<(Result<PrepareOk, Error>, Vec<Bytes>), Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let deprecate_eof = capabilities & CLIENT_DEPRECATE_EOF != 0;
    let (_, first) = read_packet(stream).await?;

    if first.first() == Some(&ERR_HEADER) {
        let error = parse_err(&first);
        return Ok((Err(error), vec![first.freeze()]));
    }

    let ok = parse_prepare_ok(&first)?;
    let mut payloads = vec![first.freeze()];

    if ok.num_params > 0 {
        for _ in 0..ok.num_params {
            let (_, def) = read_packet(stream).await?;
            payloads.push(def.freeze());
        }
        if !deprecate_eof {
            let (_, eof) = read_packet(stream).await?;
            payloads.push(eof.freeze());
        }
    }
    if ok.num_columns > 0 {
        for _ in 0..ok.num_columns {
            let (_, def) = read_packet(stream).await?;
            payloads.push(def.freeze());
        }
        if !deprecate_eof {
            let (_, eof) = read_packet(stream).await?;
            payloads.push(eof.freeze());
        }
    }

    Ok((Ok(ok), payloads))
}
