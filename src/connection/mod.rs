//! Connection management
//!
//! This module handles:
//! * Transport abstraction (injected channel provider, default TCP/TLS)
//! * Connection lifecycle (startup, query execution, idle self-close)
//! * State machine enforcement
//! * Configuration and TLS options

mod config;
mod conn;
mod state;
mod tls;
mod transport;

pub use config::{
    ConnectionConfig, ConnectionConfigBuilder, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT,
};
pub use conn::{Connection, ConnectionId, Row};
pub use state::ConnectionState;
pub use tls::{parse_server_name, SslMode, TlsConfig, TlsConfigBuilder};
pub use transport::{BoxChannel, Channel, TcpProvider, Transport, TransportProvider};
