//! Tests for the MySQL wire codec.

use bytes::{Buf, Bytes, BytesMut};

use super::constants::*;
use super::protocol::*;

#[test]
fn test_lenenc_int_round_trip() {
    for value in [0u64, 250, 251, 0xffff, 0x10000, 0xff_ffff, 0x100_0000, u64::MAX] {
        let mut buf = BytesMut::new();
        put_lenenc_int(&mut buf, value);
        let mut slice = &buf[..];
        assert_eq!(read_lenenc_int(&mut slice).unwrap(), value, "value {value}");
        assert!(!slice.has_remaining());
    }
}

#[test]
fn test_lenenc_int_boundary_encodings() {
    let mut buf = BytesMut::new();
    put_lenenc_int(&mut buf, 250);
    assert_eq!(&buf[..], &[250]);

    let mut buf = BytesMut::new();
    put_lenenc_int(&mut buf, 251);
    assert_eq!(buf[0], 0xfc);
    assert_eq!(buf.len(), 3);
}

#[test]
fn test_ok_packet_round_trip() {
    let payload = ok_payload(3, 42, SERVER_STATUS_AUTOCOMMIT);
    assert_eq!(payload[0], OK_HEADER);

    let ok = parse_ok(&payload).unwrap();
    assert_eq!(ok.affected_rows, 3);
    assert_eq!(ok.last_insert_id, 42);
    assert_eq!(ok.status, SERVER_STATUS_AUTOCOMMIT);
}

#[test]
fn test_err_packet_round_trip() {
    let payload = err_payload(1062, "23000", "Duplicate entry");
    assert_eq!(payload[0], ERR_HEADER);

    let error = parse_err(&payload);
    let (code, state, message) = backend_error_parts(&error);
    assert_eq!(code, 1062);
    assert_eq!(state, "23000");
    assert_eq!(message, "Duplicate entry");
}

#[test]
fn test_eof_terminator_detection() {
    let eof = eof_payload(SERVER_STATUS_AUTOCOMMIT);
    assert!(is_terminator(&eof, false));
    assert_eq!(
        terminator_status(&eof, false).unwrap(),
        SERVER_STATUS_AUTOCOMMIT
    );

    // A data row never counts as a terminator.
    let row = text_row_payload(&["hello"]);
    assert!(!is_terminator(&row, false));
    assert!(!is_terminator(&row, true));
}

#[test]
fn test_patch_more_results_on_ok() {
    let mut payloads = vec![ok_payload(1, 0, SERVER_STATUS_AUTOCOMMIT)];
    patch_more_results(&mut payloads, true);

    let ok = parse_ok(&payloads[0]).unwrap();
    assert_ne!(ok.status & SERVER_MORE_RESULTS_EXISTS, 0);

    patch_more_results(&mut payloads, false);
    let ok = parse_ok(&payloads[0]).unwrap();
    assert_eq!(ok.status & SERVER_MORE_RESULTS_EXISTS, 0);
}

#[test]
fn test_patch_more_results_on_eof() {
    let mut payloads = vec![eof_payload(SERVER_STATUS_AUTOCOMMIT)];
    patch_more_results(&mut payloads, true);
    let status = terminator_status(&payloads[0], false).unwrap();
    assert_ne!(status & SERVER_MORE_RESULTS_EXISTS, 0);
}

#[test]
fn test_patch_more_results_leaves_err_alone() {
    let err = err_payload(1064, "42000", "syntax error");
    let mut payloads = vec![err.clone()];
    patch_more_results(&mut payloads, true);
    assert_eq!(payloads[0], err);
}

#[test]
fn test_frame_payloads_sequencing() {
    let framed = frame_payloads(
        &[Bytes::from_static(b"ab"), Bytes::from_static(b"xyz")],
        1,
    );

    // First frame: len 2, seq 1.
    assert_eq!(&framed[..4], &[2, 0, 0, 1]);
    assert_eq!(&framed[4..6], b"ab");
    // Second frame: len 3, seq 2.
    assert_eq!(&framed[6..10], &[3, 0, 0, 2]);
    assert_eq!(&framed[10..], b"xyz");
}

#[test]
fn test_result_set_shape_with_eof() {
    let payloads = result_set_payloads(
        &["Variable_name", "Value"],
        &[vec!["Backend".into(), "cache".into()]],
        false,
        SERVER_STATUS_AUTOCOMMIT,
    );

    // column count, 2 column defs, EOF, 1 row, EOF.
    assert_eq!(payloads.len(), 6);
    assert_eq!(payloads[0][0], 2);
    assert!(is_terminator(&payloads[3], false));
    assert!(is_terminator(&payloads[5], false));
}

#[test]
fn test_result_set_shape_deprecate_eof() {
    let payloads = result_set_payloads(
        &["Variable_name", "Value"],
        &[vec!["Backend".into(), "cache".into()]],
        true,
        SERVER_STATUS_AUTOCOMMIT,
    );

    // column count, 2 column defs, 1 row, OK terminator.
    assert_eq!(payloads.len(), 5);
    assert!(is_terminator(&payloads[4], true));
}

#[test]
fn test_native_password_scramble() {
    // Empty passwords send an empty auth response.
    assert!(native_password_scramble("", b"12345678").is_empty());

    let nonce = b"abcdefghijklmnopqrst";
    let scramble = native_password_scramble("secret", nonce);
    assert_eq!(scramble.len(), 20);
    // Deterministic for the same inputs.
    assert_eq!(scramble, native_password_scramble("secret", nonce));
    assert_ne!(scramble, native_password_scramble("secret2", nonce));
}

#[test]
fn test_handshake_response_parse() {
    let payload = handshake_response_payload(
        PROXY_CAPABILITIES,
        "proxy",
        &[0u8; 20],
        "appdb",
    );

    let parsed = parse_handshake_response(&payload).unwrap();
    assert_eq!(parsed.username, "proxy");
    assert_eq!(parsed.database.as_deref(), Some("appdb"));
    assert_eq!(parsed.capabilities, PROXY_CAPABILITIES);
}

#[test]
fn test_initial_handshake_round_trip() {
    // Build a protocol 10 greeting the way a server would.
    let mut payload = BytesMut::new();
    payload.extend_from_slice(&[PROTOCOL_VERSION]);
    payload.extend_from_slice(b"8.0.39\0");
    payload.extend_from_slice(&42u32.to_le_bytes()); // thread id
    payload.extend_from_slice(b"12345678"); // nonce part 1
    payload.extend_from_slice(&[0]); // filler
    let caps = PROXY_CAPABILITIES | CLIENT_SSL;
    payload.extend_from_slice(&(caps as u16).to_le_bytes());
    payload.extend_from_slice(&[UTF8MB4_GENERAL_CI]);
    payload.extend_from_slice(&SERVER_STATUS_AUTOCOMMIT.to_le_bytes());
    payload.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
    payload.extend_from_slice(&[21]); // auth data length
    payload.extend_from_slice(&[0; 10]); // reserved
    payload.extend_from_slice(b"901234567890\0"); // nonce part 2 + NUL
    payload.extend_from_slice(b"mysql_native_password\0");

    let handshake = parse_initial_handshake(&payload).unwrap();
    assert_eq!(handshake.server_version, "8.0.39");
    assert_eq!(handshake.capabilities, caps);
    assert_eq!(handshake.auth_data, b"12345678901234567890");
    assert_eq!(handshake.auth_plugin, "mysql_native_password");

    // The relayed copy must not advertise TLS.
    let stripped = strip_ssl_capability(&payload).unwrap();
    let reparsed = parse_initial_handshake(&stripped).unwrap();
    assert_eq!(reparsed.capabilities & CLIENT_SSL, 0);
    assert_eq!(reparsed.auth_data, handshake.auth_data);
}

#[test]
fn test_split_stmt_execute() {
    let payload = com_stmt_execute(7, b"\x00\x01\x08\x00\x2a\x00\x00\x00\x00\x00\x00\x00");
    let (statement_id, tail) = split_stmt_execute(&payload).unwrap();
    assert_eq!(statement_id, 7);
    assert_eq!(tail.len(), 12);
}

#[test]
fn test_normalize_execute_tail_keeps_bound_types() {
    // 1 param: null bitmap (1 byte), new-params-bound = 1, type
    // LONGLONG, value.
    let tail = Bytes::from_static(&[0x00, 0x01, 0x08, 0x00, 1, 0, 0, 0, 0, 0, 0, 0]);
    let (normalized, types) = normalize_execute_tail(&tail, 1, None).unwrap();
    assert_eq!(normalized, tail);
    assert_eq!(types.unwrap(), Bytes::from_static(&[0x08, 0x00]));
}

#[test]
fn test_normalize_execute_tail_splices_cached_types() {
    let cached = Bytes::from_static(&[0x08, 0x00]);
    // new-params-bound = 0, so no types follow the bitmap.
    let tail = Bytes::from_static(&[0x00, 0x00, 2, 0, 0, 0, 0, 0, 0, 0]);
    let (normalized, types) = normalize_execute_tail(&tail, 1, Some(&cached)).unwrap();

    assert!(types.is_none());
    assert_eq!(normalized[0], 0x00); // bitmap
    assert_eq!(normalized[1], 1); // forced new-params-bound
    assert_eq!(&normalized[2..4], &[0x08, 0x00]); // spliced types
    assert_eq!(&normalized[4..], &tail[2..]); // values
}

#[test]
fn test_normalize_execute_tail_without_types_fails() {
    let tail = Bytes::from_static(&[0x00, 0x00, 2, 0]);
    assert!(normalize_execute_tail(&tail, 1, None).is_err());
}

#[test]
fn test_prepare_ok_parse() {
    let mut payload = BytesMut::new();
    payload.extend_from_slice(&[OK_HEADER]);
    payload.extend_from_slice(&9u32.to_le_bytes());
    payload.extend_from_slice(&0u16.to_le_bytes()); // columns
    payload.extend_from_slice(&2u16.to_le_bytes()); // params
    payload.extend_from_slice(&[0]); // filler
    payload.extend_from_slice(&0u16.to_le_bytes()); // warnings

    let ok = parse_prepare_ok(&payload).unwrap();
    assert_eq!(ok.statement_id, 9);
    assert_eq!(ok.num_params, 2);
    assert_eq!(ok.num_columns, 0);
}

#[tokio::test]
async fn test_packet_io_round_trip() {
    let (mut a, mut b) = tokio::io::duplex(1024);

    let next = write_packet(&mut a, 0, &com_query("SELECT 1")).await.unwrap();
    assert_eq!(next, 1);

    let (seq, payload) = read_packet(&mut b).await.unwrap();
    assert_eq!(seq, 0);
    assert_eq!(payload[0], COM_QUERY);
    assert_eq!(&payload[1..], b"SELECT 1");
}

#[tokio::test]
async fn test_read_query_response_ok() {
    let (mut a, mut b) = tokio::io::duplex(1024);
    write_packet(&mut a, 1, &ok_payload(5, 0, SERVER_STATUS_AUTOCOMMIT))
        .await
        .unwrap();

    let response = read_query_response(&mut b, PROXY_CAPABILITIES).await.unwrap();
    assert_eq!(
        response.kind,
        ResponseKind::Ok(OkData {
            affected_rows: 5,
            last_insert_id: 0,
            status: SERVER_STATUS_AUTOCOMMIT,
            warnings: 0,
        })
    );
    assert!(!response.more_results());
}

#[tokio::test]
async fn test_read_query_response_result_set() {
    let (mut a, mut b) = tokio::io::duplex(4096);
    let payloads = result_set_payloads(
        &["Value"],
        &[vec!["1".into()], vec!["2".into()]],
        false,
        SERVER_STATUS_AUTOCOMMIT,
    );
    write_payloads(&mut a, 1, &payloads).await.unwrap();

    let response = read_query_response(&mut b, PROXY_CAPABILITIES).await.unwrap();
    assert_eq!(
        response.kind,
        ResponseKind::ResultSet {
            status: SERVER_STATUS_AUTOCOMMIT
        }
    );
    assert_eq!(response.payloads.len(), payloads.len());
}

#[tokio::test]
async fn test_read_full_response_follows_more_results() {
    let (mut a, mut b) = tokio::io::duplex(1024);

    // Two OK results chained by the more-results bit.
    write_packet(
        &mut a,
        1,
        &ok_payload(1, 0, SERVER_STATUS_AUTOCOMMIT | SERVER_MORE_RESULTS_EXISTS),
    )
    .await
    .unwrap();
    write_packet(&mut a, 2, &ok_payload(2, 0, SERVER_STATUS_AUTOCOMMIT))
        .await
        .unwrap();

    let response = read_full_response(&mut b, PROXY_CAPABILITIES).await.unwrap();
    assert_eq!(response.payloads.len(), 2);
    assert!(!response.more_results());
    assert_eq!(
        response.kind,
        ResponseKind::Ok(OkData {
            affected_rows: 2,
            last_insert_id: 0,
            status: SERVER_STATUS_AUTOCOMMIT,
            warnings: 0,
        })
    );
}

#[tokio::test]
async fn test_read_query_response_transaction_status() {
    let (mut a, mut b) = tokio::io::duplex(1024);
    write_packet(&mut a, 1, &ok_payload(0, 0, SERVER_STATUS_IN_TRANS))
        .await
        .unwrap();

    let response = read_query_response(&mut b, PROXY_CAPABILITIES).await.unwrap();
    assert_ne!(response.status() & SERVER_STATUS_IN_TRANS, 0);
}

#[tokio::test]
async fn test_read_query_response_error() {
    let (mut a, mut b) = tokio::io::duplex(1024);
    write_packet(&mut a, 1, &err_payload(1146, "42S02", "Table 't' doesn't exist"))
        .await
        .unwrap();

    let response = read_query_response(&mut b, PROXY_CAPABILITIES).await.unwrap();
    assert!(response.is_error());
    assert!(matches!(
        response.error().unwrap(),
        crate::errors::Error::BackendQuery { .. }
    ));
}
