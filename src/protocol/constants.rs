//! Wire protocol constants

/// Protocol version 1.0
pub const PROTOCOL_VERSION: i32 = 0x0001_0000;

/// Largest frame accepted from the server (64 MiB)
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Query id reserved for session-level errors
pub const SESSION_QUERY_ID: u32 = 0;

/// Frontend message tags
pub mod frontend {
    /// Password message
    pub const PASSWORD: u8 = b'p';

    /// Query message
    pub const QUERY: u8 = b'Q';

    /// Terminate message
    pub const TERMINATE: u8 = b'X';
}

/// Backend message tags
pub mod tags {
    /// Authentication request
    pub const AUTHENTICATION: u8 = b'R';

    /// Row data for one query
    pub const DATA_ROWS: u8 = b'D';

    /// Error response
    pub const ERROR_RESPONSE: u8 = b'E';

    /// Notice response
    pub const NOTICE_RESPONSE: u8 = b'N';

    /// Parameter status
    pub const PARAMETER_STATUS: u8 = b'S';

    /// Ready for query (handshake acknowledgement)
    pub const READY_FOR_QUERY: u8 = b'Z';
}

/// Authentication types
pub mod auth {
    /// Authentication successful
    pub const OK: i32 = 0;

    /// Cleartext password required
    pub const CLEARTEXT_PASSWORD: i32 = 3;
}

/// Session status carried by ReadyForQuery
pub mod status {
    /// Idle, accepting queries
    pub const IDLE: u8 = b'I';
}
