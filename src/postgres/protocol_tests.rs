//! Tests for the PostgreSQL wire codec.

use bytes::BytesMut;

use super::protocol::*;
use crate::hints::StatementKind;

#[test]
fn test_simple_query_layout() {
    let message = simple_query("SELECT 1");
    assert_eq!(message[0], b'Q');
    let len = i32::from_be_bytes([message[1], message[2], message[3], message[4]]);
    assert_eq!(len as usize, message.len() - 1);
    assert_eq!(&message[5..message.len() - 1], b"SELECT 1");
    assert_eq!(message[message.len() - 1], 0);
}

#[test]
fn test_command_complete_tag_round_trip() {
    let message = command_complete("INSERT 0 5");
    assert_eq!(command_complete_tag(&message).as_deref(), Some("INSERT 0 5"));
}

#[test]
fn test_affected_rows_from_tag() {
    assert_eq!(affected_rows_from_tag("INSERT 0 5"), 5);
    assert_eq!(affected_rows_from_tag("UPDATE 3"), 3);
    assert_eq!(affected_rows_from_tag("DELETE 12"), 12);
    assert_eq!(affected_rows_from_tag("BEGIN"), 0);
}

#[test]
fn test_write_tags() {
    assert_eq!(write_tag(StatementKind::Insert, 7), "INSERT 0 7");
    assert_eq!(write_tag(StatementKind::Update, 2), "UPDATE 2");
    assert_eq!(write_tag(StatementKind::Delete, 1), "DELETE 1");
}

#[test]
fn test_ready_for_query_status() {
    let idle = ready_for_query(b'I');
    assert_eq!(idle[0], b'Z');
    assert_eq!(idle[5], b'I');

    let in_tx = ready_for_query(b'T');
    assert_eq!(in_tx[5], b'T');
}

#[test]
fn test_error_response_fields() {
    let message = error_response("relation \"t\" does not exist", "42P01");
    assert_eq!(message[0], b'E');

    let (code, text) = parse_error_fields(&message);
    assert_eq!(code, "42P01");
    assert_eq!(text, "relation \"t\" does not exist");

    let error = backend_error(&message);
    assert_eq!(
        error,
        crate::errors::Error::BackendQuery {
            code: "42P01".into(),
            message: "relation \"t\" does not exist".into(),
        }
    );
}

#[test]
fn test_row_description_and_data_row() {
    let desc = row_description(&["Variable_name", "Value"]);
    assert_eq!(desc[0], b'T');
    // Column count.
    assert_eq!(i16::from_be_bytes([desc[5], desc[6]]), 2);

    let row = data_row(&["Backend", "cache"]);
    assert_eq!(row[0], b'D');
    assert_eq!(i16::from_be_bytes([row[5], row[6]]), 2);
}

#[test]
fn test_parse_message_round_trip() {
    let message = parse_message("stmt1", "INSERT INTO t(v) VALUES ($1)");
    let (name, query) = parse_parse_message(&message).unwrap();
    assert_eq!(name, "stmt1");
    assert_eq!(query, "INSERT INTO t(v) VALUES ($1)");
}

#[test]
fn test_bind_message_round_trip() {
    // Raw parameter section: no format codes, one parameter "1", no
    // result format codes.
    let mut raw = BytesMut::new();
    raw.extend_from_slice(&0i16.to_be_bytes());
    raw.extend_from_slice(&1i16.to_be_bytes());
    raw.extend_from_slice(&1i32.to_be_bytes());
    raw.extend_from_slice(b"1");
    raw.extend_from_slice(&0i16.to_be_bytes());

    let message = bind_message("portal1", "stmt1", &raw);
    let (portal, statement, params) = parse_bind_message(&message).unwrap();
    assert_eq!(portal, "portal1");
    assert_eq!(statement, "stmt1");
    assert_eq!(&params[..], &raw[..]);
}

#[test]
fn test_execute_message_round_trip() {
    let message = execute_message("portal1");
    assert_eq!(parse_execute_message(&message).unwrap(), "portal1");

    let unnamed = execute_message("");
    assert_eq!(parse_execute_message(&unnamed).unwrap(), "");
}

#[test]
fn test_parse_startup_params() {
    let mut body = BytesMut::new();
    body.extend_from_slice(b"user\0alice\0database\0app\0\0");

    let params = parse_startup_params(body).unwrap();
    assert_eq!(params.get("user").map(String::as_str), Some("alice"));
    assert_eq!(params.get("database").map(String::as_str), Some("app"));
}

#[test]
fn test_parse_startup_params_requires_user() {
    let mut body = BytesMut::new();
    body.extend_from_slice(b"database\0app\0\0");
    assert!(parse_startup_params(body).is_err());
}

#[test]
fn test_md5_hash_password_shape() {
    let hashed = md5_hash_password("alice", "secret", &[1, 2, 3, 4]);
    assert!(hashed.starts_with(b"md5"));
    // md5 + 32 hex chars + NUL.
    assert_eq!(hashed.len(), 36);
    assert_eq!(*hashed.last().unwrap(), 0);
}

#[tokio::test]
async fn test_message_io_round_trip() {
    let (mut a, mut b) = tokio::io::duplex(1024);

    write_all_flush(&mut a, &simple_query("SELECT 1")).await.unwrap();
    let (code, message) = read_message(&mut b).await.unwrap();

    assert_eq!(code, b'Q');
    assert_eq!(&message_body(&message)[..8], b"SELECT 1");
}

#[tokio::test]
async fn test_read_startup_round_trip() {
    use bytes::BufMut;

    let (mut a, mut b) = tokio::io::duplex(1024);

    let mut params = BytesMut::new();
    params.extend_from_slice(b"user\0alice\0\0");
    let mut startup_packet = BytesMut::new();
    startup_packet.put_i32(8 + params.len() as i32);
    startup_packet.put_i32(PROTOCOL_VERSION);
    startup_packet.extend_from_slice(&params);
    write_all_flush(&mut a, &startup_packet).await.unwrap();

    let (code, body) = read_startup(&mut b).await.unwrap();
    assert_eq!(code, PROTOCOL_VERSION);
    let parsed = parse_startup_params(body).unwrap();
    assert_eq!(parsed.get("user").map(String::as_str), Some("alice"));
}
