//! RESP2 wire format encoding and parsing.
//!
//! This module implements the client side of the Redis Serialization
//! Protocol: commands are serialized as arrays of bulk strings and server
//! replies are parsed incrementally from a growing byte buffer. The parser
//! is binary-safe (bulk strings may contain any octet, including CR and LF)
//! and tolerates arbitrary fragmentation of the input stream.

use thiserror::Error;

/// Upper bound for a single bulk string or array declared on the wire.
///
/// Redis caps bulk strings at 512 MB; a length prefix beyond that is
/// treated as a framing fault rather than an allocation request.
const MAX_DECLARED_LENGTH: i64 = 512 * 1024 * 1024;

/// Errors produced while parsing RESP frames.
///
/// Every variant is fatal to the connection that produced it: once the
/// framing is off there is no way to know where the next frame starts.
#[derive(Error, Debug, PartialEq, Clone)]
pub enum RespError {
    #[error("unknown RESP type byte: {0:#04x}")]
    UnknownType(u8),
    #[error("invalid UTF-8 sequence")]
    InvalidUtf8,
    #[error("invalid integer")]
    InvalidInteger,
    #[error("invalid declared length")]
    InvalidLength,
    #[error("declared length exceeds the 512 MB limit")]
    LengthLimitExceeded,
    #[error("bulk string is not terminated by CRLF")]
    UnterminatedBulkString,
}

/// A single RESP2 value as read from or written to the wire.
///
/// Null bulk strings (`$-1`) and null arrays (`*-1`) are distinct from
/// their empty counterparts, which is why both carry an `Option`.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// `+OK` style single-line replies.
    SimpleString(String),
    /// `-ERR ...` replies.
    Error(String),
    /// `:42` replies.
    Integer(i64),
    /// `$N` length-prefixed byte strings; `None` for `$-1`.
    BulkString(Option<Vec<u8>>),
    /// `*N` sequences of values; `None` for `*-1`.
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Attempts to parse one complete value from the start of `buffer`.
    ///
    /// The parser never consumes input itself; it reports how many bytes
    /// the value occupied so the caller can advance its buffer. When the
    /// buffer only holds a prefix of a frame, `Ok(None)` is returned and
    /// the caller should retry once more bytes have arrived.
    ///
    /// # Arguments
    ///
    /// * `buffer` - Bytes received from the server, starting at a frame
    ///   boundary
    ///
    /// # Returns
    ///
    /// * `Ok(Some((value, consumed)))` - A complete value and its size in bytes
    /// * `Ok(None)` - More bytes are needed
    /// * `Err(RespError)` - The stream is malformed; the connection must be torn down
    pub fn parse(buffer: &[u8]) -> Result<Option<(RespValue, usize)>, RespError> {
        if buffer.is_empty() {
            return Ok(None);
        }

        match buffer[0] {
            b'+' => parse_simple_string(buffer),
            b'-' => parse_error(buffer),
            b':' => parse_integer(buffer),
            b'$' => parse_bulk_string(buffer),
            b'*' => parse_array(buffer),
            other => Err(RespError::UnknownType(other)),
        }
    }

    /// Serializes this value into RESP2 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(text) => {
                out.push(b'+');
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Error(text) => {
                out.push(b'-');
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Integer(value) => {
                out.push(b':');
                out.extend_from_slice(value.to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            RespValue::BulkString(None) => {
                out.extend_from_slice(b"$-1\r\n");
            }
            RespValue::BulkString(Some(data)) => {
                out.push(b'$');
                out.extend_from_slice(data.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Array(None) => {
                out.extend_from_slice(b"*-1\r\n");
            }
            RespValue::Array(Some(items)) => {
                out.push(b'*');
                out.extend_from_slice(items.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                for item in items {
                    item.encode_into(out);
                }
            }
        }
    }

    /// Returns the value's textual content as bytes, if it has one.
    ///
    /// Covers the two shapes servers use interchangeably for strings:
    /// simple strings and non-null bulk strings.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::SimpleString(text) => Some(text.as_bytes()),
            RespValue::BulkString(Some(data)) => Some(data),
            _ => None,
        }
    }

    /// Returns the integer content, if this value is an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(value) => Some(*value),
            _ => None,
        }
    }
}

/// Serializes a command as a RESP2 array of bulk strings.
///
/// Commands are always written in this shape, even single-word ones, so
/// the server never has to guess at inline syntax. The output is appended
/// to `out`, which callers reuse across commands.
///
/// # Arguments
///
/// * `args` - Command name followed by its arguments, as raw bytes
/// * `out` - Destination buffer; not cleared before writing
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    out.extend_from_slice(args.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");

    for arg in args {
        out.push(b'$');
        out.extend_from_slice(arg.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

fn find_crlf(buffer: &[u8], start: usize) -> Option<usize> {
    buffer[start..]
        .windows(2)
        .position(|window| window == b"\r\n")
        .map(|pos| start + pos)
}

fn parse_simple_string(buffer: &[u8]) -> Result<Option<(RespValue, usize)>, RespError> {
    let Some(crlf) = find_crlf(buffer, 1) else {
        return Ok(None);
    };

    let text = String::from_utf8(buffer[1..crlf].to_vec()).map_err(|_| RespError::InvalidUtf8)?;

    Ok(Some((RespValue::SimpleString(text), crlf + 2)))
}

fn parse_error(buffer: &[u8]) -> Result<Option<(RespValue, usize)>, RespError> {
    let Some(crlf) = find_crlf(buffer, 1) else {
        return Ok(None);
    };

    let text = String::from_utf8(buffer[1..crlf].to_vec()).map_err(|_| RespError::InvalidUtf8)?;

    Ok(Some((RespValue::Error(text), crlf + 2)))
}

fn parse_integer(buffer: &[u8]) -> Result<Option<(RespValue, usize)>, RespError> {
    let Some(crlf) = find_crlf(buffer, 1) else {
        return Ok(None);
    };

    let value = parse_signed_decimal(&buffer[1..crlf]).ok_or(RespError::InvalidInteger)?;

    Ok(Some((RespValue::Integer(value), crlf + 2)))
}

fn parse_bulk_string(buffer: &[u8]) -> Result<Option<(RespValue, usize)>, RespError> {
    let Some(crlf) = find_crlf(buffer, 1) else {
        return Ok(None);
    };

    let declared = parse_signed_decimal(&buffer[1..crlf]).ok_or(RespError::InvalidLength)?;

    if declared == -1 {
        return Ok(Some((RespValue::BulkString(None), crlf + 2)));
    }

    if declared < 0 {
        return Err(RespError::InvalidLength);
    }

    if declared > MAX_DECLARED_LENGTH {
        return Err(RespError::LengthLimitExceeded);
    }

    let length = declared as usize;
    let data_start = crlf + 2;
    let data_end = data_start + length;
    let frame_end = data_end + 2;

    if buffer.len() < frame_end {
        return Ok(None);
    }

    // The declared length is authoritative; the terminator must sit
    // exactly at the declared position.
    if &buffer[data_end..frame_end] != b"\r\n" {
        return Err(RespError::UnterminatedBulkString);
    }

    let data = buffer[data_start..data_end].to_vec();

    Ok(Some((RespValue::BulkString(Some(data)), frame_end)))
}

fn parse_array(buffer: &[u8]) -> Result<Option<(RespValue, usize)>, RespError> {
    let Some(crlf) = find_crlf(buffer, 1) else {
        return Ok(None);
    };

    let declared = parse_signed_decimal(&buffer[1..crlf]).ok_or(RespError::InvalidLength)?;

    if declared == -1 {
        return Ok(Some((RespValue::Array(None), crlf + 2)));
    }

    if declared < 0 {
        return Err(RespError::InvalidLength);
    }

    if declared > MAX_DECLARED_LENGTH {
        return Err(RespError::LengthLimitExceeded);
    }

    let mut items = Vec::with_capacity(declared as usize);
    let mut consumed = crlf + 2;

    while items.len() < declared as usize {
        let Some((item, item_len)) = RespValue::parse(&buffer[consumed..])? else {
            return Ok(None);
        };

        items.push(item);
        consumed += item_len;
    }

    Ok(Some((RespValue::Array(Some(items)), consumed)))
}

/// Parses a base-10 integer with an optional leading minus sign.
///
/// Stricter than `str::parse`: no leading `+`, no whitespace, no empty
/// digit run, and overflow is rejected instead of wrapped.
fn parse_signed_decimal(data: &[u8]) -> Option<i64> {
    let (negative, digits) = match data.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, data),
    };

    if digits.is_empty() {
        return None;
    }

    let mut value: i64 = 0;

    for &byte in digits {
        if !byte.is_ascii_digit() {
            return None;
        }

        value = value.checked_mul(10)?.checked_add((byte - b'0') as i64)?;
    }

    if negative {
        Some(-value)
    } else {
        Some(value)
    }
}
