//! Error types for pgkit.
//!
//! Every operation returns [`Error`], which carries enough classification for
//! callers to branch on "duplicate key" vs "serialization conflict" vs
//! "connection lost" without matching on message text.

use thiserror::Error;

use crate::pg::error::PgError;

#[derive(Error, Debug)]
pub enum Error {
    /// Network or handshake failure while establishing a session.
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or out-of-sequence frame. The connection is discarded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Error reported by the server, with its SQLSTATE.
    #[error(transparent)]
    Query(#[from] PgError),

    #[error("Scan error: {0}")]
    Scan(String),

    #[error("Type mismatch: column {column:?} ({found}) cannot be read as {expected}")]
    TypeMismatch {
        column: String,
        expected: &'static str,
        found: String,
    },

    #[error("pg: no rows in result set")]
    NoRows,

    #[error("pg: multiple rows in result set")]
    TooManyRows,

    #[error("Operation timed out")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,

    /// Copy aborted mid-stream by the local side. The connection stays usable.
    #[error("COPY aborted: {0}")]
    Copy(String),

    /// The reconnect policy ran out of attempts.
    #[error("Connection unavailable after {attempts} attempt(s): {source}")]
    ConnectionUnavailable {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Listener is closed")]
    ListenerClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    /// Query arguments do not match the placeholders.
    #[error("Argument error: {0}")]
    Argument(String),
}

impl Error {
    /// Network-level failure that a reconnect may fix.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Io(_) | Error::ConnectionClosed
        )
    }

    /// The connection that produced this error can no longer be used.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Connection(_) | Error::Io(_) | Error::Protocol(_) | Error::ConnectionClosed => {
                true
            }
            Error::Query(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// The server-reported error, if any.
    pub fn pg_error(&self) -> Option<&PgError> {
        match self {
            Error::Query(e) => Some(e),
            Error::ConnectionUnavailable { source, .. } => source.pg_error(),
            _ => None,
        }
    }

    /// SQLSTATE code of a server-reported error.
    pub fn sqlstate(&self) -> Option<&str> {
        self.pg_error().map(|e| e.code())
    }

    pub fn is_integrity_violation(&self) -> bool {
        self.pg_error().is_some_and(|e| e.integrity_violation())
    }

    pub fn is_serialization_failure(&self) -> bool {
        self.pg_error().is_some_and(|e| e.serialization_failure())
    }

    /// Whether a whole transaction may be retried after this error
    /// (SQLSTATE class `40`: serialization failure, deadlock).
    pub fn is_retryable_transaction(&self) -> bool {
        self.pg_error().is_some_and(|e| e.class() == "40")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
