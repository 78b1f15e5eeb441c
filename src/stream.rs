//! Binary stream primitives shared by every on-wire and on-disk format.
//!
//! Encoding rules:
//! - `vint` / `vlong`: 7-bit groups, lowest group first, high bit = continuation
//! - fixed-width integers: big-endian
//! - strings and byte arrays: `vint` length prefix followed by the raw bytes
//! - booleans: a single 0/1 byte
//!
//! Every length or count read from the input is checked against the bytes
//! that remain before anything is allocated. A malformed prefix fails the
//! decode with a [`CodecError`] instead of an unbounded allocation.

use thiserror::Error;

/// Largest element count accepted for any decoded list.
pub const MAX_LIST_LEN: usize = 1 << 24;

/// Errors raised while decoding a binary stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unexpected end of stream: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("variable-length integer is longer than {max_bytes} bytes")]
    VarIntTooLong { max_bytes: usize },

    #[error("negative value {value} where a length or count was expected")]
    NegativeLength { value: i64 },

    #[error("declared {what} count {declared} exceeds limit {limit}")]
    CountTooLarge {
        what: &'static str,
        declared: usize,
        limit: usize,
    },

    #[error("invalid UTF-8 in string: {0}")]
    InvalidUtf8(String),

    #[error("unknown {what} tag {tag}")]
    UnknownTag { what: &'static str, tag: u8 },

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),
}

/// Result type for decode operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Growable output buffer.
#[derive(Debug, Default, Clone)]
pub struct StreamOutput {
    buf: Vec<u8>,
}

impl StreamOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Write a 32-bit value as a variable-length integer.
    ///
    /// Negative values are written as their unsigned bit pattern and always
    /// take five bytes.
    pub fn write_vint(&mut self, value: i32) {
        let mut v = value as u32;
        while v & !0x7F != 0 {
            self.buf.push(((v & 0x7F) | 0x80) as u8);
            v >>= 7;
        }
        self.buf.push(v as u8);
    }

    /// Write a non-negative 64-bit value as a variable-length integer.
    pub fn write_vlong(&mut self, value: u64) {
        let mut v = value;
        while v & !0x7F != 0 {
            self.buf.push(((v & 0x7F) | 0x80) as u8);
            v >>= 7;
        }
        self.buf.push(v as u8);
    }

    /// Write a length or count prefix.
    ///
    /// Up to `i32::MAX` the bytes match `write_vint`. A larger value keeps
    /// all of its bits, so `read_len` rejects it instead of reading back a
    /// wrapped length.
    pub fn write_len(&mut self, len: usize) {
        self.write_vlong(u64::try_from(len).unwrap_or(u64::MAX));
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_len(value.len());
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_len(value.len());
        self.buf.extend_from_slice(value);
    }

    pub fn write_optional_string(&mut self, value: Option<&str>) {
        match value {
            Some(s) => {
                self.write_bool(true);
                self.write_string(s);
            }
            None => self.write_bool(false),
        }
    }

    pub fn write_string_list(&mut self, values: &[String]) {
        self.write_len(values.len());
        for value in values {
            self.write_string(value);
        }
    }

    pub fn write_vlong_list(&mut self, values: &[u64]) {
        self.write_len(values.len());
        for value in values {
            self.write_vlong(*value);
        }
    }
}

/// Cursor over an encoded buffer.
#[derive(Debug, Clone)]
pub struct StreamInput<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> StreamInput<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Fail if any bytes are left unread.
    pub fn finish(&self) -> CodecResult<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }

    fn take(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> CodecResult<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidData(format!(
                "boolean byte must be 0 or 1, got {}",
                other
            ))),
        }
    }

    pub fn read_i32(&mut self) -> CodecResult<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i64(&mut self) -> CodecResult<i64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(i64::from_be_bytes(arr))
    }

    pub fn read_vint(&mut self) -> CodecResult<i32> {
        let mut result: u32 = 0;
        for i in 0..5 {
            let b = self.read_u8()?;
            // the fifth group holds only the top four bits
            if i == 4 && b & 0xF0 != 0 {
                return Err(CodecError::VarIntTooLong { max_bytes: 5 });
            }
            result |= u32::from(b & 0x7F) << (7 * i);
            if b & 0x80 == 0 {
                return Ok(result as i32);
            }
        }
        Err(CodecError::VarIntTooLong { max_bytes: 5 })
    }

    pub fn read_vlong(&mut self) -> CodecResult<u64> {
        let mut result: u64 = 0;
        for i in 0..10 {
            let b = self.read_u8()?;
            result |= u64::from(b & 0x7F) << (7 * i);
            if b & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(CodecError::VarIntTooLong { max_bytes: 10 })
    }

    /// Read a length prefix for a byte run and check it fits in the input.
    pub fn read_len(&mut self) -> CodecResult<usize> {
        let raw = self.read_vint()?;
        if raw < 0 {
            return Err(CodecError::NegativeLength {
                value: i64::from(raw),
            });
        }
        let len = raw as usize;
        if len > self.remaining() {
            return Err(CodecError::UnexpectedEof {
                needed: len,
                remaining: self.remaining(),
            });
        }
        Ok(len)
    }

    /// Read a list element count.
    ///
    /// Every element occupies at least `min_element_bytes`, so a count that
    /// cannot fit in the remaining input is rejected before allocation.
    pub fn read_count(&mut self, what: &'static str, min_element_bytes: usize) -> CodecResult<usize> {
        let raw = self.read_vint()?;
        if raw < 0 {
            return Err(CodecError::NegativeLength {
                value: i64::from(raw),
            });
        }
        let count = raw as usize;
        let limit = (self.remaining() / min_element_bytes.max(1)).min(MAX_LIST_LEN);
        if count > limit {
            return Err(CodecError::CountTooLarge {
                what,
                declared: count,
                limit,
            });
        }
        Ok(count)
    }

    pub fn read_string(&mut self) -> CodecResult<String> {
        let len = self.read_len()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::InvalidUtf8(e.to_string()))
    }

    pub fn read_bytes(&mut self) -> CodecResult<Vec<u8>> {
        let len = self.read_len()?;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_optional_string(&mut self) -> CodecResult<Option<String>> {
        if self.read_bool()? {
            Ok(Some(self.read_string()?))
        } else {
            Ok(None)
        }
    }

    pub fn read_string_list(&mut self, what: &'static str) -> CodecResult<Vec<String>> {
        let count = self.read_count(what, 1)?;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.read_string()?);
        }
        Ok(values)
    }

    pub fn read_vlong_list(&mut self, what: &'static str) -> CodecResult<Vec<u64>> {
        let count = self.read_count(what, 1)?;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.read_vlong()?);
        }
        Ok(values)
    }

    /// Read a list whose elements are decoded by `read_one`.
    pub fn read_list<T, F>(
        &mut self,
        what: &'static str,
        min_element_bytes: usize,
        mut read_one: F,
    ) -> CodecResult<Vec<T>>
    where
        F: FnMut(&mut Self) -> CodecResult<T>,
    {
        let count = self.read_count(what, min_element_bytes)?;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(read_one(self)?);
        }
        Ok(values)
    }
}
