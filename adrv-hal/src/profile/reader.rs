use std::io::{Read, Seek, SeekFrom};

use super::layout::{Field, PROFILE_SIZE};
use crate::codec::decode_uint;
use crate::Error;

/// Seek-and-decode access to a binary profile.
///
/// The source is size-checked once on construction; after that every read
/// seeks to a [`Field`]'s offset and decodes exactly its width. Any failure
/// comes back as [`Error::ProfileField`] naming the field.
pub struct ProfileReader<R> {
    inner: R,
    len: u64,
}

impl<R: Read + Seek> ProfileReader<R> {
    /// Wrap a profile source, checking its size.
    ///
    /// # Errors
    ///
    /// [`Error::FileSize`] if the source is empty, shorter than the profile
    /// structure, or not a multiple of 4 bytes. [`Error::Io`] if the source
    /// can't be seeked.
    pub fn new(mut inner: R) -> Result<Self, Error> {
        const WHAT: &str = "device profile";
        let len = inner.seek(SeekFrom::End(0))?;
        if len == 0 {
            return Err(Error::FileSize {
                what: WHAT,
                size: 0,
                reason: "file is empty",
            });
        }
        if len < PROFILE_SIZE as u64 {
            return Err(Error::FileSize {
                what: WHAT,
                size: len,
                reason: "smaller than the profile structure",
            });
        }
        if len % 4 != 0 {
            return Err(Error::FileSize {
                what: WHAT,
                size: len,
                reason: "not a multiple of 4 bytes",
            });
        }
        Ok(Self { inner, len })
    }

    /// Size of the underlying source in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True if the source is empty. Never true for a constructed reader.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read the raw bytes of a field into `buf`, which must be exactly
    /// `field.width` long.
    pub fn raw(&mut self, field: Field, buf: &mut [u8]) -> Result<(), Error> {
        let err = || Error::ProfileField {
            field: field.name,
            offset: field.offset,
        };
        if buf.len() != field.width as usize || field.end() as u64 > self.len {
            return Err(err());
        }
        self.inner
            .seek(SeekFrom::Start(field.offset as u64))
            .map_err(|_| err())?;
        self.inner.read_exact(buf).map_err(|_| err())
    }

    /// Read a scalar field, zero-extended.
    pub fn uint(&mut self, field: Field) -> Result<u64, Error> {
        let mut b = [0u8; 8];
        let n = (field.width as usize).min(8);
        self.raw(field, &mut b[..n])?;
        Ok(decode_uint(&b[..n], field.order))
    }

    /// Read a 1-byte field.
    pub fn u8(&mut self, field: Field) -> Result<u8, Error> {
        Ok(self.uint(field)? as u8)
    }

    /// Read a 2-byte field.
    pub fn u16(&mut self, field: Field) -> Result<u16, Error> {
        Ok(self.uint(field)? as u16)
    }

    /// Read a 2-byte signed field.
    pub fn i16(&mut self, field: Field) -> Result<i16, Error> {
        Ok(self.uint(field)? as u16 as i16)
    }

    /// Read a 4-byte field.
    pub fn u32(&mut self, field: Field) -> Result<u32, Error> {
        Ok(self.uint(field)? as u32)
    }

    /// Read a 4-byte signed field.
    pub fn i32(&mut self, field: Field) -> Result<i32, Error> {
        Ok(self.uint(field)? as u32 as i32)
    }

    /// Read `N` consecutive 1-byte elements starting at `field`.
    pub fn u8_array<const N: usize>(&mut self, field: Field) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        for (i, o) in out.iter_mut().enumerate() {
            *o = self.u8(field.nth(i as u32, 1))?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn size_checks() {
        let e = ProfileReader::new(Cursor::new(Vec::new())).err().unwrap();
        assert!(matches!(e, Error::FileSize { size: 0, .. }));
        let e = ProfileReader::new(Cursor::new(vec![0u8; PROFILE_SIZE as usize - 4]))
            .err()
            .unwrap();
        assert!(matches!(e, Error::FileSize { .. }));
        let e = ProfileReader::new(Cursor::new(vec![0u8; PROFILE_SIZE as usize + 2]))
            .err()
            .unwrap();
        assert!(matches!(e, Error::FileSize { .. }));
        assert!(ProfileReader::new(Cursor::new(vec![0u8; PROFILE_SIZE as usize])).is_ok());
    }

    #[test]
    fn reads_fields() {
        let mut buf = vec![0u8; PROFILE_SIZE as usize];
        let f = Field::new("f", 0x10, 4);
        f.encode(&mut buf, 0xfffe_0001).unwrap();
        let mut r = ProfileReader::new(Cursor::new(buf)).unwrap();
        assert_eq!(r.u32(f).unwrap(), 0xfffe_0001);
        assert_eq!(r.i32(f).unwrap(), -131_071);
        assert_eq!(r.u8_array::<2>(Field::new("g", 0x10, 1)).unwrap(), [1, 0]);
        let past = Field::new("past", PROFILE_SIZE - 2, 4);
        assert!(matches!(
            r.u32(past),
            Err(Error::ProfileField { field: "past", .. })
        ));
    }
}
