use std::{error, fmt};

#[derive(Debug, Clone)]
pub enum Error {
    BufferOverflow,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BufferOverflow => "buffer overflow",
        })
    }
}

impl error::Error for Error {}

/// Checked little-endian reader over a byte buffer.
#[derive(Debug, Clone)]
pub struct Cursor<'input> {
    buffer: &'input [u8],
    offset: usize,
}

impl<'input> Cursor<'input> {
    #[must_use]
    pub fn new(buffer: &'input [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    #[must_use]
    pub fn is_at_end(&self) -> bool {
        self.offset >= self.buffer.len()
    }

    /// Number of bytes that can still be read.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.offset
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'input [u8], Error> {
        let end = self.offset.checked_add(len).ok_or(Error::BufferOverflow)?;
        let data = self
            .buffer
            .get(self.offset..end)
            .ok_or(Error::BufferOverflow)?;
        self.offset = end;
        Ok(data)
    }

    pub fn u8(&mut self) -> Result<u8, Error> {
        let byte = *self.buffer.get(self.offset).ok_or(Error::BufferOverflow)?;
        self.offset += 1;
        Ok(byte)
    }

    pub fn u32(&mut self) -> Result<u32, Error> {
        let word: [u8; 4] = self.bytes(4)?.try_into().map_err(|_| Error::BufferOverflow)?;
        Ok(u32::from_le_bytes(word))
    }

    pub fn f64(&mut self) -> Result<f64, Error> {
        let word: [u8; 8] = self.bytes(8)?.try_into().map_err(|_| Error::BufferOverflow)?;
        Ok(f64::from_le_bytes(word))
    }
}

#[test]
fn test_cursor_scalars() {
    let mut c = Cursor::new(&[0x2A, 0x01, 0x02, 0x03, 0x04, 0xFF]);
    assert_eq!(0x2A, c.u8().unwrap());
    assert_eq!(0x04030201, c.u32().unwrap());
    assert_eq!(1, c.remaining());
    assert!(c.u32().is_err());
    assert_eq!(0xFF, c.u8().unwrap());
    assert!(c.is_at_end());
    assert!(c.u8().is_err());
}

#[test]
fn test_cursor_f64() {
    let mut data = Vec::new();
    data.extend_from_slice(&2.5f64.to_le_bytes());
    data.extend_from_slice(&(-1.0f64).to_le_bytes());
    let mut c = Cursor::new(&data);
    assert_eq!(2.5, c.f64().unwrap());
    assert_eq!(-1.0, c.f64().unwrap());
    assert!(c.f64().is_err());
}

#[test]
fn test_cursor_bytes() {
    let mut c = Cursor::new(&[1, 2, 3, 4, 5]);
    assert_eq!([1, 2], c.bytes(2).unwrap());
    assert!(c.bytes(4).is_err());
    assert_eq!([3, 4, 5], c.bytes(3).unwrap());
    assert_eq!(c.bytes(0).unwrap(), &[] as &[u8]);
}
