//! Canonical encoding primitives.
//!
//! All multi-byte integers are big-endian and fixed width. Variable-length
//! data (byte strings, vectors) carries a `u32` length whose value is
//! validated against the remaining input before any allocation. Options are
//! a `0`/`1` word followed by the payload; union variants are a `u32` tag.
//!
//! Encoding is infallible and deterministic: equal values always produce
//! identical bytes, which is what lets hashes of encoded values (quorum-set
//! hashes, flood ids) serve as identities.

use crate::error::WireError;

/// A type that can be written in the canonical encoding.
pub trait WireEncode {
    /// Append the canonical encoding of `self` to `buf`.
    fn encode(&self, buf: &mut Vec<u8>);

    /// Encode into a fresh buffer.
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

/// A type that can be read back from the canonical encoding.
pub trait WireDecode: Sized {
    /// Decode one value, advancing the reader.
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError>;

    /// Decode a value that must consume the entire input.
    fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(bytes);
        let value = Self::decode(&mut r)?;
        r.expect_end()?;
        Ok(value)
    }
}

/// Checked cursor over an input buffer.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Create a reader over `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Current read position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Read `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if len > self.remaining() {
            return Err(WireError::UnexpectedEof(self.pos));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Read a fixed 32-byte array.
    pub fn read_array32(&mut self) -> Result<[u8; 32], WireError> {
        let bytes = self.read_bytes(32)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Read a big-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a big-endian `u64`.
    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let bytes = self.read_bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(arr))
    }

    /// Read a length word, validated against the remaining input.
    ///
    /// `unit` is the minimum encoded size of one element, so a hostile
    /// length can never force an allocation larger than the input itself.
    pub fn read_len(&mut self, unit: usize) -> Result<usize, WireError> {
        let declared = self.read_u32()? as usize;
        let need = declared.saturating_mul(unit.max(1));
        if need > self.remaining() {
            return Err(WireError::LengthOverrun {
                declared,
                remaining: self.remaining(),
            });
        }
        Ok(declared)
    }

    /// Fail unless the whole input has been consumed.
    pub fn expect_end(&self) -> Result<(), WireError> {
        if self.remaining() != 0 {
            return Err(WireError::TrailingBytes(self.remaining()));
        }
        Ok(())
    }
}

impl WireEncode for u32 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_be_bytes());
    }
}

impl WireDecode for u32 {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        r.read_u32()
    }
}

impl WireEncode for u64 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_be_bytes());
    }
}

impl WireDecode for u64 {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        r.read_u64()
    }
}

// u16 rides in a full word so every integer on the wire is 4 or 8 bytes.
impl WireEncode for u16 {
    fn encode(&self, buf: &mut Vec<u8>) {
        (*self as u32).encode(buf);
    }
}

impl WireDecode for u16 {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let word = r.read_u32()?;
        u16::try_from(word).map_err(|_| WireError::OutOfRange("u16"))
    }
}

impl WireEncode for [u8; 32] {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self);
    }
}

impl WireDecode for [u8; 32] {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        r.read_array32()
    }
}

/// Write a length-prefixed byte string.
///
/// Byte strings go through these free helpers rather than an impl on
/// `Vec<u8>`, which would collide with the element-wise `Vec<T>` impls.
pub fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    (bytes.len() as u32).encode(buf);
    buf.extend_from_slice(bytes);
}

/// Read a length-prefixed byte string.
pub fn get_bytes(r: &mut Reader<'_>) -> Result<Vec<u8>, WireError> {
    let len = r.read_len(1)?;
    Ok(r.read_bytes(len)?.to_vec())
}

/// Write a list of length-prefixed byte strings.
pub fn put_bytes_list(buf: &mut Vec<u8>, lists: &[Vec<u8>]) {
    (lists.len() as u32).encode(buf);
    for bytes in lists {
        put_bytes(buf, bytes);
    }
}

/// Read a list of length-prefixed byte strings.
pub fn get_bytes_list(r: &mut Reader<'_>) -> Result<Vec<Vec<u8>>, WireError> {
    let count = r.read_len(4)?;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(get_bytes(r)?);
    }
    Ok(out)
}

impl WireEncode for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.len() as u32).encode(buf);
        buf.extend_from_slice(self.as_bytes());
    }
}

impl WireDecode for String {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let len = r.read_len(1)?;
        let bytes = r.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }
}

impl<T: WireEncode> WireEncode for Option<T> {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            None => 0u32.encode(buf),
            Some(value) => {
                1u32.encode(buf);
                value.encode(buf);
            }
        }
    }
}

impl<T: WireDecode> WireDecode for Option<T> {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        match r.read_u32()? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(r)?)),
            _ => Err(WireError::OutOfRange("option flag")),
        }
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.len() as u32).encode(buf);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: WireDecode> WireDecode for Vec<T> {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        // Every element costs at least one word on the wire.
        let len = r.read_len(4)?;
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(T::decode(r)?);
        }
        Ok(out)
    }
}
