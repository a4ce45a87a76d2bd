//! Error types

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by connections, the pool, the sanitizer and the adapter
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration (bad ssl mode, missing field, malformed connection string).
    ///
    /// Raised before any network I/O and never retried.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Opening the channel or completing the startup handshake failed
    #[error("connection failed: {message}")]
    Connect {
        /// What failed
        message: String,
        /// Underlying cause, if any
        #[source]
        source: Option<Box<Error>>,
    },

    /// No response arrived within the query timeout.
    ///
    /// Only the in-flight call fails; the connection stays usable.
    #[error("query timed out after {0:?}")]
    QueryTimeout(Duration),

    /// Query failed: server error, malformed response, transport error mid-query,
    /// or any failure surfaced through the adapter facade
    #[error("{message}")]
    Query {
        /// Description of the failure
        message: String,
        /// Original cause, if any
        #[source]
        source: Option<Box<Error>>,
    },

    /// The template has more placeholders than supplied parameters
    #[error("parameter count mismatch: {placeholders} placeholders but {supplied} parameters")]
    ParamCountMismatch {
        /// Placeholders found in the template
        placeholders: usize,
        /// Parameters supplied by the caller
        supplied: usize,
    },

    /// The connection is closing or closed
    #[error("connection closed")]
    ConnectionClosed,

    /// The pool API was used incorrectly (double release, foreign connection)
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(String),

    /// Illegal connection state transition
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Undecodable or unexpected frame from the server
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error on the channel
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Connect error without an underlying cause
    pub fn connect(message: impl Into<String>) -> Self {
        Error::Connect {
            message: message.into(),
            source: None,
        }
    }

    /// Connect error wrapping a cause
    pub fn connect_with(message: impl Into<String>, source: Error) -> Self {
        Error::Connect {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Query error without an underlying cause
    pub fn query(message: impl Into<String>) -> Self {
        Error::Query {
            message: message.into(),
            source: None,
        }
    }

    /// Query error wrapping a cause
    pub fn query_with(message: impl Into<String>, source: Error) -> Self {
        Error::Query {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Wrap into a [`Error::Query`] carrying `self` as its cause.
    ///
    /// Errors that are already `Query` are returned unchanged.
    pub fn into_query(self) -> Self {
        match self {
            Error::Query { .. } => self,
            other => Error::Query {
                message: format!("query failed: {}", other),
                source: Some(Box::new(other)),
            },
        }
    }

    /// The wrapped cause of a `Query` or `Connect` error
    pub fn cause(&self) -> Option<&Error> {
        match self {
            Error::Query { source, .. } | Error::Connect { source, .. } => source.as_deref(),
            _ => None,
        }
    }

    /// Innermost error in the `cause()` chain
    pub fn root_cause(&self) -> &Error {
        let mut current = self;
        while let Some(next) = current.cause() {
            current = next;
        }
        current
    }

    /// Stable label used for metrics and logs
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Connect { .. } => "connect",
            Error::QueryTimeout(_) => "query_timeout",
            Error::Query { .. } => "query",
            Error::ParamCountMismatch { .. } => "param_count_mismatch",
            Error::ConnectionClosed => "connection_closed",
            Error::ProtocolMisuse(_) => "protocol_misuse",
            Error::InvalidState { .. } => "invalid_state",
            Error::Protocol(_) => "protocol",
            Error::Io(_) => "io",
        }
    }

    /// Whether the same call may succeed if retried (possibly on another connection).
    ///
    /// Configuration, sanitizer and misuse errors never are.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Connect { .. }
            | Error::QueryTimeout(_)
            | Error::ConnectionClosed
            | Error::Io(_) => true,
            Error::Query { source, .. } => source.as_deref().is_some_and(Error::is_retriable),
            _ => false,
        }
    }
}
