// Byte-level helpers shared by the message decoders.

use bytes::{Buf, BytesMut};

use crate::errors::Error;

/// Checked reads over a message body. The `bytes` getters panic on
/// underflow; a truncated body must surface as a protocol violation
/// instead.
pub trait SafeBuf {
    fn try_get_u8(&mut self) -> Result<u8, Error>;
    fn try_get_i16(&mut self) -> Result<i16, Error>;
    fn try_get_i32(&mut self) -> Result<i32, Error>;
    fn try_get_i64(&mut self) -> Result<i64, Error>;
    fn try_split_to(&mut self, n: usize) -> Result<BytesMut, Error>;
    fn read_cstring(&mut self) -> Result<String, Error>;
}

fn need(buf: &BytesMut, n: usize) -> Result<(), Error> {
    if buf.remaining() < n {
        return Err(Error::ProtocolViolation(format!(
            "message body truncated: needed {n} more bytes, had {}",
            buf.remaining()
        )));
    }
    Ok(())
}

impl SafeBuf for BytesMut {
    fn try_get_u8(&mut self) -> Result<u8, Error> {
        need(self, 1)?;
        Ok(self.get_u8())
    }

    fn try_get_i16(&mut self) -> Result<i16, Error> {
        need(self, 2)?;
        Ok(self.get_i16())
    }

    fn try_get_i32(&mut self) -> Result<i32, Error> {
        need(self, 4)?;
        Ok(self.get_i32())
    }

    fn try_get_i64(&mut self) -> Result<i64, Error> {
        need(self, 8)?;
        Ok(self.get_i64())
    }

    fn try_split_to(&mut self, n: usize) -> Result<BytesMut, Error> {
        need(self, n)?;
        Ok(self.split_to(n))
    }

    /// Read up to the next NUL, consuming it.
    fn read_cstring(&mut self) -> Result<String, Error> {
        let nul = self
            .iter()
            .position(|&byte| byte == b'\0')
            .ok_or_else(|| Error::ProtocolViolation("unterminated string".to_string()))?;
        let bytes = self.split_to(nul + 1);
        Ok(String::from_utf8_lossy(&bytes[..bytes.len() - 1]).into_owned())
    }
}
