//! Errors.

/// Various errors.
///
/// All payloads are owned strings so that a single failure can be fanned
/// out to every request of a flushed batch by cloning.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("socket error occurred: {0}")]
    SocketError(String),
    #[error("protocol synchronization error: {0}")]
    ProtocolSyncError(String),
    #[error("bad config: {0}")]
    BadConfig(String),
    #[error("backend authentication failed: {0}")]
    BackendAuth(String),
    #[error("backend error {code}: {message}")]
    BackendQuery { code: String, message: String },
    #[error("write batcher is closed")]
    BatcherClosed,
    #[error("write batcher timed out waiting for flush")]
    BatcherTimeout,
    #[error("prepared statement {0:?} does not exist")]
    PreparedStatementNotFound(String),
    #[error("max message size")]
    MaxMessageSize,
    #[error("shutting down")]
    ShuttingDown,
}

impl Error {
    /// True for failures that originate on the backend link and should
    /// tear down the owning client connection.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            Error::SocketError(_) | Error::ProtocolSyncError(_) | Error::BackendAuth(_)
        )
    }
}

/// Identifier of a client connection, used in log and error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentifier {
    pub addr: String,
    pub username: String,
    pub database: String,
}

impl ClientIdentifier {
    pub fn new(addr: &str, username: &str, database: &str) -> ClientIdentifier {
        ClientIdentifier {
            addr: addr.into(),
            username: username.into(),
            database: database.into(),
        }
    }
}

impl std::fmt::Display for ClientIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let Self {
            addr,
            username,
            database,
        } = self;
        write!(f, "{{ {username}@{addr}/{database} }}")
    }
}
