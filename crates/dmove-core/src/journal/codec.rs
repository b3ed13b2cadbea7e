//! Byte-level encoding for plan files: zigzag varints, little-endian fixed
//! ints and length-prefixed strings.

use thiserror::Error;

/// Decoding failure with the byte offset where it was detected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unexpected end of data at offset {offset}")]
    UnexpectedEof { offset: usize },
    #[error("varint too long at offset {offset}")]
    VarintOverflow { offset: usize },
    #[error("negative length {len} at offset {offset}")]
    NegativeLength { offset: usize, len: i64 },
    #[error("invalid utf-8 string at offset {offset}")]
    InvalidUtf8 { offset: usize },
}

pub fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

pub fn zigzag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

/// Append `v` as a zigzag varint: 7-bit groups, low group first, high bit set
/// on every byte except the last.
pub fn write_varint(out: &mut Vec<u8>, v: i64) {
    let mut u = zigzag_encode(v);
    loop {
        let byte = (u & 0x7f) as u8;
        u >>= 7;
        if u == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Append a varint byte length followed by the UTF-8 bytes of `s`.
pub fn write_string(out: &mut Vec<u8>, s: &str) {
    write_varint(out, s.len() as i64);
    out.extend_from_slice(s.as_bytes());
}

pub fn write_i32_le(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Cursor over an encoded buffer.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof { offset: self.pos });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_i32_le(&mut self) -> Result<i32, CodecError> {
        let b = self.read_bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_varint(&mut self) -> Result<i64, CodecError> {
        let start = self.pos;
        let mut u = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self
                .read_u8()
                .map_err(|_| CodecError::UnexpectedEof { offset: start })?;
            if shift >= 64 || (shift == 63 && byte & 0x7e != 0) {
                return Err(CodecError::VarintOverflow { offset: start });
            }
            u |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(zigzag_decode(u));
            }
            shift += 7;
        }
    }

    /// Read a varint that must be a non-negative length.
    pub fn read_len(&mut self) -> Result<usize, CodecError> {
        let offset = self.pos;
        let len = self.read_varint()?;
        if len < 0 {
            return Err(CodecError::NegativeLength { offset, len });
        }
        Ok(len as usize)
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let offset = self.pos;
        let len = self.read_len()?;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8 { offset })
    }
}
