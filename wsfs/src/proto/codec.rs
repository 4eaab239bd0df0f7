use super::errors::{ProtoError, ProtoResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use deku::DekuContainerWrite;

/// Length prefix of every variable-length field.
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

/// Appends big-endian primitives to a growable buffer.
#[derive(Debug)]
pub struct PacketWriter {
    buf: Option<BytesMut>,
}

impl Default for PacketWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Some(BytesMut::with_capacity(capacity)),
        }
    }

    fn buf(&mut self) -> ProtoResult<&mut BytesMut> {
        self.buf.as_mut().ok_or(ProtoError::UseAfterFinalize)
    }

    pub fn u8(&mut self, value: u8) -> ProtoResult<()> {
        self.buf()?.put_u8(value);
        Ok(())
    }

    pub fn u16(&mut self, value: u16) -> ProtoResult<()> {
        self.buf()?.put_u16(value);
        Ok(())
    }

    pub fn u32(&mut self, value: u32) -> ProtoResult<()> {
        self.buf()?.put_u32(value);
        Ok(())
    }

    pub fn u64(&mut self, value: u64) -> ProtoResult<()> {
        self.buf()?.put_u64(value);
        Ok(())
    }

    pub fn i32(&mut self, value: i32) -> ProtoResult<()> {
        self.buf()?.put_i32(value);
        Ok(())
    }

    pub fn i64(&mut self, value: i64) -> ProtoResult<()> {
        self.buf()?.put_i64(value);
        Ok(())
    }

    /// A `u16` length followed by the raw bytes.
    pub fn buffer(&mut self, data: &[u8]) -> ProtoResult<()> {
        if data.len() > MAX_FIELD_LEN {
            return Err(ProtoError::BufferTooLarge(data.len()));
        }
        let buf = self.buf()?;
        buf.put_u16(data.len() as u16);
        buf.put_slice(data);
        Ok(())
    }

    pub fn string(&mut self, value: &str) -> ProtoResult<()> {
        self.buffer(value.as_bytes())
    }

    /// Appends a fixed-layout block.
    pub fn put_deku<T: DekuContainerWrite>(&mut self, value: &T) -> ProtoResult<()> {
        let encoded = value.to_bytes()?;
        self.buf()?.put_slice(&encoded);
        Ok(())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len())
    }

    /// Hands out the encoded packet. The writer rejects all further use.
    pub fn finalize(&mut self) -> ProtoResult<Bytes> {
        self.buf
            .take()
            .map(BytesMut::freeze)
            .ok_or(ProtoError::UseAfterFinalize)
    }
}

/// Consumes big-endian primitives from a received packet.
#[derive(Debug, Clone)]
pub struct PacketReader {
    buf: Bytes,
}

impl PacketReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    #[cfg(test)]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, needed: usize) -> ProtoResult<()> {
        if self.buf.remaining() < needed {
            Err(ProtoError::TruncatedMessage {
                needed,
                remaining: self.buf.remaining(),
            })
        } else {
            Ok(())
        }
    }

    pub fn u8(&mut self) -> ProtoResult<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> ProtoResult<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn u32(&mut self) -> ProtoResult<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn u64(&mut self) -> ProtoResult<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn i32(&mut self) -> ProtoResult<i32> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn i64(&mut self) -> ProtoResult<i64> {
        self.ensure(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn buffer(&mut self) -> ProtoResult<Bytes> {
        let len = self.u16()? as usize;
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn string(&mut self) -> ProtoResult<String> {
        let data = self.buffer()?;
        String::from_utf8(data.to_vec()).map_err(|_| ProtoError::InvalidUtf8)
    }

    /// Reads a fixed-layout block. Only replies carry these.
    #[cfg(test)]
    pub fn get_deku<T>(&mut self) -> ProtoResult<T>
    where
        T: for<'a> deku::DekuContainerRead<'a>,
    {
        let total = self.buf.len();
        let ((rest, _), value) = T::from_bytes((self.buf.as_ref(), 0)).map_err(|e| match e {
            deku::DekuError::Incomplete(_) => ProtoError::TruncatedMessage {
                needed: total + 1,
                remaining: total,
            },
            other => ProtoError::Deku(other),
        })?;
        let consumed = total - rest.len();
        self.buf.advance(consumed);
        Ok(value)
    }
}
