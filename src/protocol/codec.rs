//! PostgreSQL wire protocol encoding and decoding primitives.
//!
//! PostgreSQL uses big-endian (network byte order) for all integers.

use crate::error::{Error, Result};

/// Length of a backend message header: type byte + 4-byte length.
pub const HEADER_LEN: usize = 5;

/// Largest message the server is allowed to send (PostgreSQL's own limit is 1 GiB).
pub const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Decode a backend message header at the start of `data`.
///
/// Returns `(type_byte, payload_len)`, or `None` when the header is not
/// complete yet. A length field smaller than 4 or larger than
/// [`MAX_MESSAGE_LEN`] means the stream is out of sync.
#[inline]
pub fn read_header(data: &[u8]) -> Result<Option<(u8, usize)>> {
    let Some((&type_byte, rest)) = data.split_first() else {
        return Ok(None);
    };
    let Some(len) = rest.first_chunk::<4>() else {
        return Ok(None);
    };
    let len = i32::from_be_bytes(*len);
    if len < 4 || len as usize > MAX_MESSAGE_LEN {
        return Err(Error::Protocol(format!(
            "invalid length {} for message '{}'",
            len, type_byte as char
        )));
    }
    Ok(Some((type_byte, len as usize - 4)))
}

/// Read 4-byte big-endian signed integer.
#[inline]
pub fn read_i32(data: &[u8]) -> Result<(i32, &[u8])> {
    let (bytes, rest) = data.split_first_chunk::<4>().ok_or_else(|| {
        Error::Protocol(format!("read_i32: buffer too short: {} < 4", data.len()))
    })?;
    Ok((i32::from_be_bytes(*bytes), rest))
}

/// Read 4-byte big-endian unsigned integer.
#[inline]
pub fn read_u32(data: &[u8]) -> Result<(u32, &[u8])> {
    let (bytes, rest) = data.split_first_chunk::<4>().ok_or_else(|| {
        Error::Protocol(format!("read_u32: buffer too short: {} < 4", data.len()))
    })?;
    Ok((u32::from_be_bytes(*bytes), rest))
}

/// Read null-terminated string (PostgreSQL String type).
/// Returns the string bytes (without the null terminator) and remaining data.
#[inline]
pub fn read_cstring(data: &[u8]) -> Result<(&[u8], &[u8])> {
    match memchr::memchr(0, data) {
        Some(pos) => Ok((&data[..pos], &data[pos + 1..])),
        None => Err(Error::Protocol(
            "read_cstring: no null terminator found".into(),
        )),
    }
}

/// Read null-terminated string as &str.
#[inline]
pub fn read_cstr(data: &[u8]) -> Result<(&str, &[u8])> {
    let (bytes, rest) = read_cstring(data)?;
    let s = simdutf8::compat::from_utf8(bytes)
        .map_err(|e| Error::Protocol(format!("read_cstr: invalid UTF-8: {e}")))?;
    Ok((s, rest))
}

/// Message builder helper that handles the length field.
///
/// PostgreSQL message format:
/// - Type byte (1 byte) - NOT included in length
/// - Length (4 bytes) - includes itself
/// - Payload (Length - 4 bytes)
pub struct MessageBuilder<'a> {
    buf: &'a mut Vec<u8>,
    start: usize,
}

impl<'a> MessageBuilder<'a> {
    /// Start building a message with a type byte.
    pub fn new(buf: &'a mut Vec<u8>, type_byte: u8) -> Self {
        buf.push(type_byte);
        Self::new_startup(buf)
    }

    /// Start building a startup-phase message (no type byte).
    pub fn new_startup(buf: &'a mut Vec<u8>) -> Self {
        let start = buf.len();
        buf.extend_from_slice(&[0; 4]);
        Self { buf, start }
    }

    /// Write a u8.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Write an i16.
    pub fn write_i16(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Write an i32.
    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Write null-terminated string.
    pub fn write_cstr(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /// Finish building the message and fill in the length field.
    pub fn finish(self) {
        let len = (self.buf.len() - self.start) as i32;
        self.buf[self.start..self.start + 4].copy_from_slice(&len.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_header_incomplete() {
        assert!(read_header(&[]).unwrap().is_none());
        assert!(read_header(&[b'Z', 0, 0]).unwrap().is_none());
    }

    #[test]
    fn test_read_header_complete() {
        let (type_byte, len) = read_header(&[b'Z', 0, 0, 0, 5, b'I']).unwrap().unwrap();
        assert_eq!(type_byte, b'Z');
        assert_eq!(len, 1);
    }

    #[test]
    fn test_read_header_rejects_short_length() {
        assert!(read_header(&[b'Z', 0, 0, 0, 3]).is_err());
        assert!(read_header(&[b'D', 0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_read_cstr() {
        let (s, rest) = read_cstr(b"abc\0def").unwrap();
        assert_eq!(s, "abc");
        assert_eq!(rest, b"def");
        assert!(read_cstr(b"abc").is_err());
    }

    #[test]
    fn test_message_builder_length() {
        let mut buf = Vec::new();
        let mut msg = MessageBuilder::new(&mut buf, b'Q');
        msg.write_cstr("x");
        msg.finish();
        assert_eq!(buf, vec![b'Q', 0, 0, 0, 6, b'x', 0]);
    }
}
