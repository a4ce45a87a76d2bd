//! Wire framing
//!
//! Every frame except startup is `tag:u8 | length:i32 BE (includes itself) | body`.
//! Queries carry a `u32` id that the server echoes on the matching `DataRows` or
//! `ErrorResponse`, so a response can only ever settle the query that asked for it.

pub mod constants;
pub mod decode;
pub mod encode;
mod message;

pub use decode::decode_message;
pub use encode::encode_message;
pub use message::{AuthenticationMessage, BackendMessage, ErrorFields, FrontendMessage};
