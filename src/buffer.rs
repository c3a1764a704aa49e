//! Frame codec: buffered reads and writes of length-prefixed, type-tagged
//! protocol messages. This layer owns the byte cursors and knows nothing
//! about message semantics.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::Error;

/// Read side: a growable byte array with a read cursor and a fill cursor.
/// `ensure(n)` fills from the stream until `n` bytes are buffered; hitting
/// EOF mid-message breaks the connection.
#[derive(Debug)]
pub struct ReadBuffer {
    buf: Vec<u8>,
    start: usize,
    end: usize,
    pub bytes_read: u64,
}

impl ReadBuffer {
    pub fn new(size: usize) -> ReadBuffer {
        ReadBuffer {
            buf: vec![0u8; size.max(512)],
            start: 0,
            end: 0,
            bytes_read: 0,
        }
    }

    #[inline(always)]
    pub fn buffered(&self) -> usize {
        self.end - self.start
    }

    /// Guarantee `n` readable bytes, compacting consumed space first and
    /// growing the array only when a single message exceeds it.
    pub async fn ensure<S>(&mut self, stream: &mut S, n: usize) -> Result<(), Error>
    where
        S: AsyncRead + Unpin,
    {
        if self.buffered() >= n {
            return Ok(());
        }
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        if n > self.buf.len() {
            self.buf.resize(n.next_power_of_two(), 0);
        }
        while self.buffered() < n {
            let read = match stream.read(&mut self.buf[self.end..]).await {
                Ok(read) => read,
                Err(err) => return Err(Error::Broken(format!("error reading from socket: {err}"))),
            };
            if read == 0 {
                return Err(Error::Broken(
                    "connection closed by server mid-message".to_string(),
                ));
            }
            self.end += read;
            self.bytes_read += read as u64;
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&[u8], Error> {
        if self.buffered() < n {
            return Err(Error::ProtocolViolation(format!(
                "attempted to read {n} bytes with only {} buffered",
                self.buffered()
            )));
        }
        let slice = &self.buf[self.start..self.start + n];
        self.start += n;
        Ok(slice)
    }

    pub fn read_byte(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i16(&mut self) -> Result<i16, Error> {
        let bytes = self.take(2)?;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, Error> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&[u8], Error> {
        self.take(n)
    }

    /// A NUL-terminated string inside an already-ensured message body.
    pub fn read_cstring(&mut self) -> Result<String, Error> {
        let nul = self.buf[self.start..self.end]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| {
                Error::ProtocolViolation("unterminated string in message".to_string())
            })?;
        let s = String::from_utf8_lossy(&self.buf[self.start..self.start + nul]).into_owned();
        self.start += nul + 1;
        Ok(s)
    }

    pub fn read_string(&mut self, len: usize) -> Result<String, Error> {
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Write side: message assembly with back-patched inclusive lengths and a
/// direct-write path for payloads larger than the buffer.
#[derive(Debug)]
pub struct WriteBuffer {
    buf: BytesMut,
    msg_start: Option<usize>,
    capacity: usize,
    pub bytes_flushed: u64,
}

impl WriteBuffer {
    pub fn new(size: usize) -> WriteBuffer {
        let capacity = size.max(512);
        WriteBuffer {
            buf: BytesMut::with_capacity(capacity),
            msg_start: None,
            capacity,
            bytes_flushed: 0,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The bytes assembled so far, without consuming them.
    #[inline(always)]
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Start a tagged message. The 4-byte length is reserved and patched by
    /// `end_message`.
    pub fn begin_message(&mut self, tag: u8) {
        debug_assert!(self.msg_start.is_none(), "nested begin_message");
        self.buf.put_u8(tag);
        self.msg_start = Some(self.buf.len());
        self.buf.put_i32(0);
    }

    pub fn end_message(&mut self) {
        let start = self.msg_start.take().expect("end_message without begin_message");
        let len = (self.buf.len() - start) as i32;
        self.buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    }

    pub fn write_byte(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buf.put_i16(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    pub fn write_cstring(&mut self, value: &str) {
        self.buf.put_slice(value.as_bytes());
        self.buf.put_u8(0);
    }

    /// The startup packet has no tag byte, only an inclusive length.
    pub fn write_startup_packet(&mut self, protocol: i32, parameters: &[(&str, &str)]) {
        let start = self.buf.len();
        self.buf.put_i32(0);
        self.buf.put_i32(protocol);
        for (key, value) in parameters {
            self.write_cstring(key);
            self.write_cstring(value);
        }
        self.buf.put_u8(0);
        let len = (self.buf.len() - start) as i32;
        self.buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    }

    /// Payloads at least this large skip the buffer and go straight to the
    /// socket after a flush.
    #[inline(always)]
    pub fn bypasses_buffer(&self, payload_len: usize) -> bool {
        payload_len >= self.capacity
    }

    pub async fn flush<S>(&mut self, stream: &mut S) -> Result<(), Error>
    where
        S: AsyncWrite + Unpin,
    {
        debug_assert!(self.msg_start.is_none(), "flush inside an open message");
        if self.buf.is_empty() {
            return Ok(());
        }
        if let Err(err) = stream.write_all(&self.buf).await {
            return Err(Error::Broken(format!("error writing to socket: {err}")));
        }
        if let Err(err) = stream.flush().await {
            return Err(Error::Broken(format!("error flushing socket: {err}")));
        }
        self.bytes_flushed += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }

    /// Direct-write path: flush buffered messages, then write the payload
    /// without copying it through the buffer.
    pub async fn write_direct<S>(&mut self, stream: &mut S, payload: &[u8]) -> Result<(), Error>
    where
        S: AsyncWrite + Unpin,
    {
        self.flush(stream).await?;
        if let Err(err) = stream.write_all(payload).await {
            return Err(Error::Broken(format!("error writing to socket: {err}")));
        }
        if let Err(err) = stream.flush().await {
            return Err(Error::Broken(format!("error flushing socket: {err}")));
        }
        self.bytes_flushed += payload.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_fills_across_reads_and_grows_on_demand() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
            client.write_all(&payload).await.unwrap();
        });

        // 1000 bytes exceed the initial 512-byte array, forcing growth.
        let mut buffer = ReadBuffer::new(16);
        buffer.ensure(&mut server, 1000).await.unwrap();
        assert_eq!(buffer.buffered(), 1000);
        assert_eq!(buffer.bytes_read, 1000);
        assert_eq!(buffer.read_byte().unwrap(), 0);
        assert_eq!(buffer.read_i16().unwrap(), 0x0102);
        let rest = buffer.read_bytes(997).unwrap();
        assert_eq!(rest[0], 3);
        assert_eq!(rest[996], (999 % 251) as u8);
    }

    #[tokio::test]
    async fn ensure_reports_eof_as_broken() {
        let (client, mut server) = tokio::io::duplex(16);
        drop(client);
        let mut buffer = ReadBuffer::new(16);
        let err = buffer.ensure(&mut server, 1).await.unwrap_err();
        assert!(matches!(err, Error::Broken(_)));
    }

    #[test]
    fn cstring_consumes_terminator() {
        let mut buffer = ReadBuffer::new(16);
        buffer.buf[..8].copy_from_slice(b"abc\0def\0");
        buffer.end = 8;
        assert_eq!(buffer.read_cstring().unwrap(), "abc");
        assert_eq!(buffer.read_cstring().unwrap(), "def");
        assert_eq!(buffered_len(&buffer), 0);
    }

    fn buffered_len(buffer: &ReadBuffer) -> usize {
        buffer.buffered()
    }

    #[tokio::test]
    async fn message_length_is_backpatched_inclusive() {
        let mut buffer = WriteBuffer::new(64);
        buffer.begin_message(b'Q');
        buffer.write_cstring("SELECT 1");
        buffer.end_message();

        let (mut a, mut b) = tokio::io::duplex(64);
        buffer.flush(&mut a).await.unwrap();
        assert_eq!(buffer.bytes_flushed, 14);

        use tokio::io::AsyncReadExt;
        let mut out = vec![0u8; 14];
        b.read_exact(&mut out).await.unwrap();
        assert_eq!(out[0], b'Q');
        assert_eq!(i32::from_be_bytes([out[1], out[2], out[3], out[4]]), 13);
        assert_eq!(&out[5..], b"SELECT 1\0");
    }

    #[tokio::test]
    async fn startup_packet_has_no_tag() {
        let mut buffer = WriteBuffer::new(64);
        buffer.write_startup_packet(196608, &[("user", "u"), ("database", "d")]);

        let (mut a, mut b) = tokio::io::duplex(64);
        buffer.flush(&mut a).await.unwrap();

        use tokio::io::AsyncReadExt;
        let len = b.read_i32().await.unwrap();
        let version = b.read_i32().await.unwrap();
        assert_eq!(version, 196608);
        let mut rest = vec![0u8; len as usize - 8];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"user\0u\0database\0d\0\0");
    }

    #[tokio::test]
    async fn oversized_payloads_bypass_the_buffer() {
        let mut buffer = WriteBuffer::new(512);
        assert!(!buffer.bypasses_buffer(100));
        assert!(buffer.bypasses_buffer(512));

        let (mut a, mut b) = tokio::io::duplex(4096);
        let payload = vec![7u8; 1024];
        buffer.write_direct(&mut a, &payload).await.unwrap();
        assert_eq!(buffer.bytes_flushed, 1024);

        use tokio::io::AsyncReadExt;
        let mut out = vec![0u8; 1024];
        b.read_exact(&mut out).await.unwrap();
        assert_eq!(out, payload);
    }
}
