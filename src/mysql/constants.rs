//! MySQL wire protocol constants.
//!
//! Packets have a 4-byte header: 3 bytes payload length (little-endian)
//! and 1 byte sequence number. Payloads of 2^24-1 bytes are continued
//! in a follow-up packet.

/// Maximum payload of a single packet (2^24 - 1).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// Protocol version byte of the initial handshake.
pub const PROTOCOL_VERSION: u8 = 10;

// Capability flags.
pub const CLIENT_LONG_PASSWORD: u32 = 1;
pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
pub const CLIENT_SSL: u32 = 1 << 11;
pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

/// Capabilities the proxy's own backend connections ask for.
pub const PROXY_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
    | CLIENT_PROTOCOL_41
    | CLIENT_TRANSACTIONS
    | CLIENT_SECURE_CONNECTION
    | CLIENT_PLUGIN_AUTH
    | CLIENT_CONNECT_WITH_DB
    | CLIENT_MULTI_RESULTS;

// Command bytes.
pub const COM_QUIT: u8 = 0x01;
pub const COM_INIT_DB: u8 = 0x02;
pub const COM_QUERY: u8 = 0x03;
pub const COM_PING: u8 = 0x0e;
pub const COM_STMT_PREPARE: u8 = 0x16;
pub const COM_STMT_EXECUTE: u8 = 0x17;
pub const COM_STMT_CLOSE: u8 = 0x19;
pub const COM_STMT_RESET: u8 = 0x1a;

// Response header bytes.
pub const OK_HEADER: u8 = 0x00;
pub const LOCAL_INFILE_HEADER: u8 = 0xfb;
pub const EOF_HEADER: u8 = 0xfe;
pub const ERR_HEADER: u8 = 0xff;

// Server status flags.
pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;

// Column types used by the synthetic result sets.
pub const MYSQL_TYPE_VAR_STRING: u8 = 0xfd;

/// utf8mb4_general_ci.
pub const UTF8MB4_GENERAL_CI: u8 = 45;

/// Authentication plugin the proxy speaks for its own connections.
pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

/// Auth packet headers seen during the handshake relay.
pub const AUTH_SWITCH_HEADER: u8 = 0xfe;
pub const AUTH_MORE_DATA_HEADER: u8 = 0x01;
