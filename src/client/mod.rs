//! Client surface: the adapter facade, connection strings and a named registry

mod adapter;
pub mod connection_string;
mod registry;

pub use adapter::Adapter;
pub use connection_string::{prefixed_connection_strings, ConnectionInfo};
pub use registry::Registry;
