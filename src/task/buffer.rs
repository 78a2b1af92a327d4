//! Cumulative receive buffer.

use std::sync::Arc;

use crate::buffer_pool::{BufferPool, PooledBuf};
use crate::error::Result;
use crate::protocol::backend::{RawMessage, msg_type};
use crate::protocol::codec::{HEADER_LEN, read_header};

/// Accumulates inbound bytes until whole messages can be decoded.
///
/// The scheduler appends; the running task consumes from the front. Bytes a
/// finished task did not consume stay for the next one. The backing storage
/// is taken from the pool on first use and handed back once fully consumed.
#[derive(Debug)]
pub struct CumulativeBuffer {
    pool: Arc<BufferPool>,
    data: Option<PooledBuf>,
    pos: usize,
}

impl CumulativeBuffer {
    /// Create an empty buffer that allocates from `pool`.
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            data: None,
            pos: 0,
        }
    }

    /// Append received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let data = self.data.get_or_insert_with(|| self.pool.acquire());
        // Reclaim consumed space before growing.
        if self.pos > 0 && self.pos * 2 >= data.len() {
            data.drain(..self.pos);
            self.pos = 0;
        }
        data.extend_from_slice(bytes);
    }

    /// Unconsumed bytes.
    pub fn remaining(&self) -> &[u8] {
        match &self.data {
            Some(data) => &data[self.pos..],
            None => &[],
        }
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.remaining().len()
    }

    /// Whether every received byte was consumed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether storage is currently held.
    pub fn is_allocated(&self) -> bool {
        self.data.is_some()
    }

    /// The first complete message, without consuming it.
    pub fn peek_message(&self) -> Result<Option<RawMessage<'_>>> {
        Self::message_at(self.remaining())
    }

    fn message_at(data: &[u8]) -> Result<Option<RawMessage<'_>>> {
        let Some((type_byte, len)) = read_header(data)? else {
            return Ok(None);
        };
        Ok(data
            .get(HEADER_LEN..HEADER_LEN + len)
            .map(|payload| RawMessage::new(type_byte, payload)))
    }

    /// Type byte of the first non-asynchronous message starting at `offset`.
    ///
    /// Returns `None` if that message has not fully arrived yet.
    pub fn peek_type_after(&self, offset: usize) -> Result<Option<u8>> {
        let mut data = self.remaining().get(offset..).unwrap_or_default();
        while let Some(msg) = Self::message_at(data)? {
            if !msg.is_async() {
                return Ok(Some(msg.type_byte));
            }
            data = &data[msg.frame_len()..];
        }
        Ok(None)
    }

    /// Consume `n` bytes.
    pub fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.pos + self.len());
        if self.is_empty() {
            self.pos = 0;
            if let Some(data) = &mut self.data {
                data.clear();
            }
        }
    }

    /// Consume a single byte (the SSLRequest answer).
    pub fn read_byte(&mut self) -> Option<u8> {
        let byte = self.remaining().first().copied()?;
        self.advance(1);
        Some(byte)
    }

    /// Consume messages up to and including the next ReadyForQuery.
    ///
    /// Returns `true` once a ReadyForQuery was consumed.
    pub fn skip_until_ready(&mut self) -> Result<bool> {
        while let Some(msg) = self.peek_message()? {
            let (type_byte, frame_len) = (msg.type_byte, msg.frame_len());
            self.advance(frame_len);
            if type_byte == msg_type::READY_FOR_QUERY {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Hand the storage back to the pool if nothing is left to read.
    pub fn release(&mut self) {
        if self.is_empty() {
            self.data = None;
            self.pos = 0;
        }
    }

    /// Drop all unconsumed bytes and the storage.
    pub fn reset(&mut self) {
        self.data = None;
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(type_byte: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![type_byte];
        buf.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    fn buffer() -> CumulativeBuffer {
        CumulativeBuffer::new(Arc::new(BufferPool::new(4)))
    }

    #[test]
    fn test_lazy_allocation_and_release() {
        let mut buf = buffer();
        assert!(!buf.is_allocated());
        buf.extend(&[]);
        assert!(!buf.is_allocated());

        buf.extend(&frame(b'Z', b"I"));
        assert!(buf.is_allocated());
        let len = buf.peek_message().unwrap().unwrap().frame_len();
        buf.advance(len);
        buf.release();
        assert!(!buf.is_allocated());
    }

    #[test]
    fn test_partial_message_cumulates() {
        let mut buf = buffer();
        let bytes = frame(b'C', b"SELECT 1\0");
        buf.extend(&bytes[..3]);
        assert!(buf.peek_message().unwrap().is_none());
        buf.extend(&bytes[3..7]);
        assert!(buf.peek_message().unwrap().is_none());
        buf.extend(&bytes[7..]);

        let msg = buf.peek_message().unwrap().unwrap();
        assert_eq!(msg.type_byte, b'C');
        assert_eq!(msg.payload, b"SELECT 1\0");
    }

    #[test]
    fn test_trailing_bytes_survive_advance() {
        let mut buf = buffer();
        let mut bytes = frame(b'Z', b"I");
        bytes.extend_from_slice(&frame(b'C', b"UPDATE 1\0")[..4]);
        buf.extend(&bytes);

        let len = buf.peek_message().unwrap().unwrap().frame_len();
        buf.advance(len);
        buf.release();
        assert_eq!(buf.len(), 4);
        assert!(buf.is_allocated());
    }

    #[test]
    fn test_peek_type_after_skips_async() {
        let mut buf = buffer();
        let complete = frame(b'C', b"INSERT 0 1\0");
        buf.extend(&complete);
        buf.extend(&frame(b'N', b"SNOTICE\0Mhi\0\0"));
        assert_eq!(buf.peek_type_after(complete.len()).unwrap(), None);

        buf.extend(&frame(b'T', &[0, 0]));
        assert_eq!(buf.peek_type_after(complete.len()).unwrap(), Some(b'T'));
    }

    #[test]
    fn test_skip_until_ready() {
        let mut buf = buffer();
        buf.extend(&frame(b'D', &[0, 0]));
        buf.extend(&frame(b'E', b"\0"));
        assert!(!buf.skip_until_ready().unwrap());
        buf.extend(&frame(b'Z', b"I"));
        buf.extend(&frame(b'A', b"tail"));
        assert!(buf.skip_until_ready().unwrap());
        assert_eq!(buf.peek_message().unwrap().unwrap().type_byte, b'A');
    }

    #[test]
    fn test_read_byte() {
        let mut buf = buffer();
        assert_eq!(buf.read_byte(), None);
        buf.extend(b"N");
        assert_eq!(buf.read_byte(), Some(b'N'));
        assert!(buf.is_empty());
    }
}
