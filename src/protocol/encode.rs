//! Protocol message encoding

use super::message::FrontendMessage;
use bytes::{BufMut, BytesMut};
use serde_json::Value;
use std::io;

/// Encode a frontend message into bytes
pub fn encode_message(msg: &FrontendMessage) -> io::Result<BytesMut> {
    let mut buf = BytesMut::new();

    match msg {
        FrontendMessage::Startup { version, params } => {
            encode_startup(&mut buf, *version, params)?;
        }
        FrontendMessage::Password(password) => {
            encode_password(&mut buf, password)?;
        }
        FrontendMessage::Query { id, sql, values } => {
            encode_query(&mut buf, *id, sql, values)?;
        }
        FrontendMessage::Terminate => {
            encode_terminate(&mut buf)?;
        }
    }

    Ok(buf)
}

fn encode_startup(buf: &mut BytesMut, version: i32, params: &[(String, String)]) -> io::Result<()> {
    // Startup messages don't have a type byte
    let len_pos = buf.len();
    buf.put_i32(0);

    buf.put_i32(version);

    for (key, value) in params {
        put_cstr(buf, key)?;
        put_cstr(buf, value)?;
    }

    // Final null terminator
    buf.put_u8(0);

    fill_length(buf, len_pos)
}

fn encode_password(buf: &mut BytesMut, password: &str) -> io::Result<()> {
    buf.put_u8(super::constants::frontend::PASSWORD);
    let len_pos = buf.len();
    buf.put_i32(0);

    put_cstr(buf, password)?;

    fill_length(buf, len_pos)
}

fn encode_query(buf: &mut BytesMut, id: u32, sql: &str, values: &[Value]) -> io::Result<()> {
    buf.put_u8(super::constants::frontend::QUERY);
    let len_pos = buf.len();
    buf.put_i32(0);

    buf.put_u32(id);
    put_cstr(buf, sql)?;

    let encoded = serde_json::to_vec(values)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    buf.put_slice(&encoded);

    fill_length(buf, len_pos)
}

fn encode_terminate(buf: &mut BytesMut) -> io::Result<()> {
    buf.put_u8(super::constants::frontend::TERMINATE);
    buf.put_i32(4); // Length includes itself
    Ok(())
}

/// Write a null-terminated string, rejecting embedded NULs
fn put_cstr(buf: &mut BytesMut, s: &str) -> io::Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "string contains a NUL byte",
        ));
    }
    buf.put(s.as_bytes());
    buf.put_u8(0);
    Ok(())
}

fn fill_length(buf: &mut BytesMut, len_pos: usize) -> io::Result<()> {
    let len = i32::try_from(buf.len() - len_pos)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
    buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}
