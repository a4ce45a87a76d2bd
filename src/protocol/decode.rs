//! Protocol message decoding

use super::constants::{auth, tags, MAX_FRAME_LENGTH};
use super::message::{AuthenticationMessage, BackendMessage, ErrorFields};
use bytes::Bytes;
use std::io;

/// Decode one backend message from the front of `data`.
///
/// # Returns
/// `Ok(Some((msg, consumed)))` - Message and number of bytes consumed
/// `Ok(None)` - The buffer does not hold a complete frame yet
/// `Err(e)` - The frame is malformed; the stream cannot be resynchronised
pub fn decode_message(data: &[u8]) -> io::Result<Option<(BackendMessage, usize)>> {
    if data.len() < 5 {
        return Ok(None);
    }

    let tag = data[0];
    let len = i32::from_be_bytes([data[1], data[2], data[3], data[4]]);

    if len < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid message length {}", len),
        ));
    }
    let len = len as usize;

    if len > MAX_FRAME_LENGTH {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "message length {} exceeds maximum allowed {}",
                len, MAX_FRAME_LENGTH
            ),
        ));
    }

    if data.len() < len + 1 {
        return Ok(None);
    }

    let body = &data[5..len + 1];

    let msg = match tag {
        tags::AUTHENTICATION => decode_authentication(body)?,
        tags::DATA_ROWS => decode_data_rows(body)?,
        tags::ERROR_RESPONSE => decode_error_response(body)?,
        tags::NOTICE_RESPONSE => decode_notice_response(body)?,
        tags::PARAMETER_STATUS => decode_parameter_status(body)?,
        tags::READY_FOR_QUERY => decode_ready_for_query(body)?,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown message tag: 0x{:02X}", tag),
            ))
        }
    };

    Ok(Some((msg, len + 1)))
}

fn truncated(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("truncated {}", what))
}

fn read_u32(data: &[u8], what: &str) -> io::Result<u32> {
    match data {
        [a, b, c, d, ..] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
        _ => Err(truncated(what)),
    }
}

/// Read a null-terminated string, returning it and the bytes consumed
fn read_cstr(data: &[u8], what: &str) -> io::Result<(String, usize)> {
    let end = data.iter().position(|&b| b == 0).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("missing null terminator in {}", what),
        )
    })?;
    let value = String::from_utf8_lossy(&data[..end]).to_string();
    Ok((value, end + 1))
}

fn decode_authentication(data: &[u8]) -> io::Result<BackendMessage> {
    let auth_type = read_u32(data, "auth type")? as i32;

    let auth_msg = match auth_type {
        auth::OK => AuthenticationMessage::Ok,
        auth::CLEARTEXT_PASSWORD => AuthenticationMessage::CleartextPassword,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported auth type: {}", auth_type),
            ))
        }
    };

    Ok(BackendMessage::Authentication(auth_msg))
}

fn decode_data_rows(data: &[u8]) -> io::Result<BackendMessage> {
    let query_id = read_u32(data, "query id")?;
    Ok(BackendMessage::DataRows {
        query_id,
        payload: Bytes::copy_from_slice(&data[4..]),
    })
}

fn decode_error_response(data: &[u8]) -> io::Result<BackendMessage> {
    let query_id = read_u32(data, "query id")?;
    let rest = &data[4..];
    let (code, consumed) = read_cstr(rest, "error code")?;
    let (message, _) = read_cstr(&rest[consumed..], "error message")?;
    Ok(BackendMessage::ErrorResponse {
        query_id,
        fields: ErrorFields { code, message },
    })
}

fn decode_notice_response(data: &[u8]) -> io::Result<BackendMessage> {
    let (message, _) = read_cstr(data, "notice")?;
    Ok(BackendMessage::NoticeResponse(message))
}

fn decode_parameter_status(data: &[u8]) -> io::Result<BackendMessage> {
    let (name, consumed) = read_cstr(data, "parameter name")?;
    let (value, _) = read_cstr(&data[consumed..], "parameter value")?;
    Ok(BackendMessage::ParameterStatus { name, value })
}

fn decode_ready_for_query(data: &[u8]) -> io::Result<BackendMessage> {
    let status = *data.first().ok_or_else(|| truncated("status byte"))?;
    Ok(BackendMessage::ReadyForQuery { status })
}
