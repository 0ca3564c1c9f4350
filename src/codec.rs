use anyhow::{anyhow, bail, Context};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// The application-level wire codec: a growable byte buffer with typed
///  append/consume primitives.
///
/// All multi-byte integers and floats are little-endian; floats are their
///  IEEE-754 bit patterns. Strings are an `i32` byte length followed by UTF-8
///  (no terminator). Booleans are packed LSB-first into a shared byte: writes
///  accumulate until eight bits are full or a non-bool write flushes the
///  partial byte, and reads follow the symmetric rule.
///
/// A buffer is used in one direction at a time: [MessageBuffer::new] starts an
///  empty buffer for writing, [MessageBuffer::from_bytes] wraps received bytes
///  for reading. Reads past the written length fail rather than yielding
///  undefined bytes.
pub struct MessageBuffer {
    buf: BytesMut,
    read_pos: usize,
    bit_byte: u8,
    /// position of the next bit within `bit_byte`, in `[0, 8)`
    bit_pos: u8,
}

impl MessageBuffer {
    pub fn new() -> MessageBuffer {
        MessageBuffer::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> MessageBuffer {
        MessageBuffer {
            buf: BytesMut::with_capacity(capacity),
            read_pos: 0,
            bit_byte: 0,
            bit_pos: 0,
        }
    }

    pub fn from_bytes(data: &[u8]) -> MessageBuffer {
        MessageBuffer {
            buf: BytesMut::from(data),
            read_pos: 0,
            bit_byte: 0,
            bit_pos: 0,
        }
    }

    /// The written bytes, including a partial bit byte if one is pending.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.buf.len() + 1);
        out.extend_from_slice(&self.buf);
        if self.bit_pos > 0 {
            out.put_u8(self.bit_byte);
        }
        out.freeze()
    }

    /// Raw view of the underlying buffer, without any pending partial bit byte.
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len() + if self.bit_pos > 0 { 1 } else { 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.read_pos
    }

    fn flush_bits(&mut self) {
        if self.bit_pos > 0 {
            self.buf.put_u8(self.bit_byte);
            self.bit_byte = 0;
            self.bit_pos = 0;
        }
    }

    pub fn write_bool(&mut self, value: bool) {
        if value {
            self.bit_byte |= 1 << self.bit_pos;
        }
        self.bit_pos += 1;
        if self.bit_pos == 8 {
            self.buf.put_u8(self.bit_byte);
            self.bit_byte = 0;
            self.bit_pos = 0;
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.flush_bits();
        self.buf.put_u8(value);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.flush_bits();
        self.buf.put_i16_le(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.flush_bits();
        self.buf.put_i32_le(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.flush_bits();
        self.buf.put_i64_le(value);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.flush_bits();
        self.buf.put_f32_le(value);
    }

    pub fn write_f64(&mut self, value: f64) {
        self.flush_bits();
        self.buf.put_f64_le(value);
    }

    pub fn write_str(&mut self, value: &str) {
        self.flush_bits();
        self.buf.put_i32_le(value.len() as i32);
        self.buf.put_slice(value.as_bytes());
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.flush_bits();
        self.buf.put_slice(value);
    }

    pub fn write_bytes_with_len(&mut self, value: &[u8]) {
        self.flush_bits();
        self.buf.put_i32_le(value.len() as i32);
        self.buf.put_slice(value);
    }

    fn take(&mut self, n: usize) -> anyhow::Result<&[u8]> {
        if self.remaining() < n {
            bail!("read of {} bytes with only {} remaining", n, self.remaining());
        }
        let slice = &self.buf[self.read_pos..self.read_pos + n];
        self.read_pos += n;
        Ok(slice)
    }

    pub fn read_bool(&mut self) -> anyhow::Result<bool> {
        if self.bit_pos == 0 {
            let mut rest = &self.buf[self.read_pos..];
            self.bit_byte = rest.try_get_u8().context("reading bool byte")?;
            self.read_pos += 1;
        }
        let bit = (self.bit_byte >> self.bit_pos) & 1;
        self.bit_pos = (self.bit_pos + 1) % 8;
        Ok(bit != 0)
    }

    pub fn read_u8(&mut self) -> anyhow::Result<u8> {
        self.bit_pos = 0;
        let mut rest = &self.buf[self.read_pos..];
        let value = rest.try_get_u8()?;
        self.read_pos += 1;
        Ok(value)
    }

    pub fn read_i16(&mut self) -> anyhow::Result<i16> {
        self.bit_pos = 0;
        let mut rest = &self.buf[self.read_pos..];
        let value = rest.try_get_i16_le()?;
        self.read_pos += 2;
        Ok(value)
    }

    pub fn read_i32(&mut self) -> anyhow::Result<i32> {
        self.bit_pos = 0;
        let mut rest = &self.buf[self.read_pos..];
        let value = rest.try_get_i32_le()?;
        self.read_pos += 4;
        Ok(value)
    }

    pub fn read_i64(&mut self) -> anyhow::Result<i64> {
        self.bit_pos = 0;
        let mut rest = &self.buf[self.read_pos..];
        let value = rest.try_get_i64_le()?;
        self.read_pos += 8;
        Ok(value)
    }

    pub fn read_f32(&mut self) -> anyhow::Result<f32> {
        self.bit_pos = 0;
        let mut rest = &self.buf[self.read_pos..];
        let value = rest.try_get_f32_le()?;
        self.read_pos += 4;
        Ok(value)
    }

    pub fn read_f64(&mut self) -> anyhow::Result<f64> {
        self.bit_pos = 0;
        let mut rest = &self.buf[self.read_pos..];
        let value = rest.try_get_f64_le()?;
        self.read_pos += 8;
        Ok(value)
    }

    pub fn read_str(&mut self) -> anyhow::Result<String> {
        let len = self.read_i32()?;
        if len < 0 {
            bail!("negative string length {}", len);
        }
        let bytes = self.take(len as usize)?.to_vec();
        String::from_utf8(bytes).map_err(|e| anyhow!("string is not valid UTF-8: {}", e))
    }

    pub fn read_bytes(&mut self, len: usize) -> anyhow::Result<Bytes> {
        self.bit_pos = 0;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    pub fn read_bytes_with_len(&mut self) -> anyhow::Result<Bytes> {
        let len = self.read_i32()?;
        if len < 0 {
            bail!("negative byte slice length {}", len);
        }
        Ok(Bytes::copy_from_slice(self.take(len as usize)?))
    }

    /// Everything from the read cursor to the end of the buffer, for payloads
    ///  whose tail is opaque to the relay.
    pub fn read_remaining(&mut self) -> Bytes {
        self.bit_pos = 0;
        let slice = &self.buf[self.read_pos..];
        self.read_pos = self.buf.len();
        Bytes::copy_from_slice(slice)
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        MessageBuffer::new()
    }
}
