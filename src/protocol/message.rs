//! Protocol message types

use bytes::Bytes;
use serde_json::Value;

/// Frontend message (client → server)
#[derive(Debug, Clone)]
pub enum FrontendMessage {
    /// Startup message
    Startup {
        /// Protocol version
        version: i32,
        /// Connection parameters (`user`, `database`, ...)
        params: Vec<(String, String)>,
    },

    /// Password message
    Password(String),

    /// Query message
    Query {
        /// Correlation id echoed back by the server
        id: u32,
        /// Query text (already sanitized when parameters were used)
        sql: String,
        /// Values bound to `$n` markers (empty for inline queries)
        values: Vec<Value>,
    },

    /// Terminate message
    Terminate,
}

/// Backend message (server → client)
#[derive(Debug, Clone)]
pub enum BackendMessage {
    /// Authentication request
    Authentication(AuthenticationMessage),

    /// Result rows for one query, still JSON-encoded
    DataRows {
        /// Query id this response answers
        query_id: u32,
        /// JSON array of row objects
        payload: Bytes,
    },

    /// Error response
    ErrorResponse {
        /// Query id this error answers (0 = session level)
        query_id: u32,
        /// Error details
        fields: ErrorFields,
    },

    /// Notice response
    NoticeResponse(String),

    /// Parameter status
    ParameterStatus {
        /// Parameter name
        name: String,
        /// Parameter value
        value: String,
    },

    /// Ready for query
    ReadyForQuery {
        /// Session status
        status: u8,
    },
}

/// Authentication message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationMessage {
    /// Authentication OK
    Ok,

    /// Cleartext password required
    CleartextPassword,
}

/// Error fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    /// Error code
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.code.is_empty() {
            write!(f, " ({})", self.code)?;
        }
        Ok(())
    }
}
