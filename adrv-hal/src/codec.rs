//! Byte-order codec for device data.
//!
//! Multi-byte values cross the SPI interface, the co-processor mailbox, and
//! binary files in the device's byte order ([`DEVICE_BYTE_ORDER`]). The
//! helpers here convert between that representation and host values without
//! relying on host struct layout.

use crate::Error;

/// Byte order of a multi-byte scalar.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    /// Least significant byte first.
    Little,
    /// Most significant byte first.
    Big,
}

/// Byte order used by the device for all profile, image, mailbox and dump
/// data.
pub const DEVICE_BYTE_ORDER: ByteOrder = ByteOrder::Little;

/// Encode a 16-bit value.
pub fn encode_u16(v: u16, order: ByteOrder) -> [u8; 2] {
    match order {
        ByteOrder::Little => v.to_le_bytes(),
        ByteOrder::Big => v.to_be_bytes(),
    }
}

/// Encode a 32-bit value.
pub fn encode_u32(v: u32, order: ByteOrder) -> [u8; 4] {
    match order {
        ByteOrder::Little => v.to_le_bytes(),
        ByteOrder::Big => v.to_be_bytes(),
    }
}

/// Encode a 64-bit value.
pub fn encode_u64(v: u64, order: ByteOrder) -> [u8; 8] {
    match order {
        ByteOrder::Little => v.to_le_bytes(),
        ByteOrder::Big => v.to_be_bytes(),
    }
}

/// Decode a 16-bit value.
pub fn decode_u16(b: [u8; 2], order: ByteOrder) -> u16 {
    match order {
        ByteOrder::Little => u16::from_le_bytes(b),
        ByteOrder::Big => u16::from_be_bytes(b),
    }
}

/// Decode a 32-bit value.
pub fn decode_u32(b: [u8; 4], order: ByteOrder) -> u32 {
    match order {
        ByteOrder::Little => u32::from_le_bytes(b),
        ByteOrder::Big => u32::from_be_bytes(b),
    }
}

/// Decode a 64-bit value.
pub fn decode_u64(b: [u8; 8], order: ByteOrder) -> u64 {
    match order {
        ByteOrder::Little => u64::from_le_bytes(b),
        ByteOrder::Big => u64::from_be_bytes(b),
    }
}

/// Decode up to 8 bytes as an unsigned integer of that width.
///
/// Used by the generic schema decoder, where field widths are only known at
/// runtime.
pub fn decode_uint(b: &[u8], order: ByteOrder) -> u64 {
    let mut v = 0u64;
    match order {
        ByteOrder::Little => {
            for (i, x) in b.iter().take(8).enumerate() {
                v |= (*x as u64) << (8 * i);
            }
        }
        ByteOrder::Big => {
            for x in b.iter().take(8) {
                v = (v << 8) | (*x as u64);
            }
        }
    }
    v
}

/// Appends device-order scalars to a byte buffer.
///
/// This is how every outgoing payload (mailbox commands, dump records) gets
/// built, so the encoding never depends on host endianness.
#[derive(Clone, Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// Start an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an empty buffer with room for `cap` bytes.
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    /// Append a byte.
    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    /// Append a 16-bit value.
    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&encode_u16(v, DEVICE_BYTE_ORDER));
        self
    }

    /// Append a signed 16-bit value.
    pub fn i16(&mut self, v: i16) -> &mut Self {
        self.u16(v as u16)
    }

    /// Append a 32-bit value.
    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&encode_u32(v, DEVICE_BYTE_ORDER));
        self
    }

    /// Append a signed 32-bit value.
    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.u32(v as u32)
    }

    /// Append a 64-bit value.
    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&encode_u64(v, DEVICE_BYTE_ORDER));
        self
    }

    /// Append a float through its IEEE-754 bit pattern.
    pub fn f32(&mut self, v: f32) -> &mut Self {
        self.u32(v.to_bits())
    }

    /// Append raw bytes.
    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Append `n` zero bytes.
    pub fn zeros(&mut self, n: usize) -> &mut Self {
        self.buf.resize(self.buf.len() + n, 0);
        self
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Borrow the bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Take the finished buffer.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads device-order scalars out of a byte slice.
///
/// Reading past the end yields [`Error::ReturnData`], since the slices fed to
/// this are nearly always responses from the device.
#[derive(Clone, Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Start reading at the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current read position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Move the read position.
    pub fn seek(&mut self, pos: usize) -> Result<(), Error> {
        if pos > self.buf.len() {
            return Err(Error::ReturnData);
        }
        self.pos = pos;
        Ok(())
    }

    /// Read `n` raw bytes.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let end = self.pos.checked_add(n).ok_or(Error::ReturnData)?;
        let s = self.buf.get(self.pos..end).ok_or(Error::ReturnData)?;
        self.pos = end;
        Ok(s)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        self.bytes(N)?.try_into().map_err(|_| Error::ReturnData)
    }

    /// Read a byte.
    pub fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.array::<1>()?[0])
    }

    /// Read a 16-bit value.
    pub fn u16(&mut self) -> Result<u16, Error> {
        Ok(decode_u16(self.array()?, DEVICE_BYTE_ORDER))
    }

    /// Read a signed 16-bit value.
    pub fn i16(&mut self) -> Result<i16, Error> {
        Ok(self.u16()? as i16)
    }

    /// Read a 32-bit value.
    pub fn u32(&mut self) -> Result<u32, Error> {
        Ok(decode_u32(self.array()?, DEVICE_BYTE_ORDER))
    }

    /// Read a signed 32-bit value.
    pub fn i32(&mut self) -> Result<i32, Error> {
        Ok(self.u32()? as i32)
    }

    /// Read a 64-bit value.
    pub fn u64(&mut self) -> Result<u64, Error> {
        Ok(decode_u64(self.array()?, DEVICE_BYTE_ORDER))
    }

    /// Read a float from its IEEE-754 bit pattern.
    pub fn f32(&mut self) -> Result<f32, Error> {
        Ok(f32::from_bits(self.u32()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_widths() {
        for order in [ByteOrder::Little, ByteOrder::Big] {
            for v in [0u16, 1, 0x1234, 0xffff] {
                assert_eq!(decode_u16(encode_u16(v, order), order), v);
            }
            for v in [0u32, 1, 0x1234_5678, u32::MAX] {
                assert_eq!(decode_u32(encode_u32(v, order), order), v);
            }
            for v in [0u64, 1, 0x0123_4567_89ab_cdef, u64::MAX] {
                assert_eq!(decode_u64(encode_u64(v, order), order), v);
            }
        }
    }

    #[test]
    fn byte_placement() {
        assert_eq!(encode_u32(0x1122_3344, ByteOrder::Little), [0x44, 0x33, 0x22, 0x11]);
        assert_eq!(encode_u32(0x1122_3344, ByteOrder::Big), [0x11, 0x22, 0x33, 0x44]);
        assert_eq!(decode_uint(&[0x34, 0x12], ByteOrder::Little), 0x1234);
        assert_eq!(decode_uint(&[0x12, 0x34, 0x56], ByteOrder::Big), 0x12_3456);
    }

    #[test]
    fn writer_reader() {
        let mut w = ByteWriter::new();
        w.u8(7).u16(0xbeef).i16(-2).u32(0xdead_beef).f32(-153.0).u64(42).zeros(2);
        assert_eq!(w.len(), 1 + 2 + 2 + 4 + 4 + 8 + 2);
        let v = w.into_vec();
        let mut r = ByteReader::new(&v);
        assert_eq!(r.u8().unwrap(), 7);
        assert_eq!(r.u16().unwrap(), 0xbeef);
        assert_eq!(r.i16().unwrap(), -2);
        assert_eq!(r.u32().unwrap(), 0xdead_beef);
        assert_eq!(r.f32().unwrap(), -153.0);
        assert_eq!(r.u64().unwrap(), 42);
        assert_eq!(r.remaining(), 2);
        assert!(matches!(r.u32(), Err(Error::ReturnData)));
    }
}
