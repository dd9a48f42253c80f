//! Primitive encodings: LEB128 varints, length prefixed strings and little
//! endian fixed width integers.

use bytes::BufMut;
use uuid::Uuid;

use crate::errors::NativeSrvError;

/// Upper bound on a single length prefixed string. Anything larger is treated
/// as a corrupted stream rather than an allocation request.
pub const MAX_STRING_SIZE: u64 = 1 << 30;

/// Error produced while decoding from a partially received buffer.
#[derive(Debug)]
pub enum DecodeError {
    /// More bytes are needed. The buffer must not be advanced.
    Incomplete,
    Invalid(NativeSrvError),
}

impl From<NativeSrvError> for DecodeError {
    fn from(e: NativeSrvError) -> Self {
        DecodeError::Invalid(e)
    }
}

pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Converts a decode result produced over a complete buffer. Running out of
/// bytes at that point means the packet was truncated.
pub fn complete<T>(res: DecodeResult<T>) -> crate::errors::Result<T> {
    match res {
        Ok(v) => Ok(v),
        Err(DecodeError::Incomplete) => Err(NativeSrvError::malformed("truncated packet")),
        Err(DecodeError::Invalid(e)) => Err(e),
    }
}

/// Cursor over a borrowed buffer.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        WireReader { buf, pos: 0 }
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn peek_u8(&self) -> DecodeResult<u8> {
        self.buf.get(self.pos).copied().ok_or(DecodeError::Incomplete)
    }

    pub fn read_bytes(&mut self, n: usize) -> DecodeResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(DecodeError::Incomplete);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> DecodeResult<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> DecodeResult<u8> {
        let v = self.peek_u8()?;
        self.pos += 1;
        Ok(v)
    }

    pub fn read_bool(&mut self) -> DecodeResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16_le(&mut self) -> DecodeResult<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32_le(&mut self) -> DecodeResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64_le(&mut self) -> DecodeResult<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32_le(&mut self) -> DecodeResult<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64_le(&mut self) -> DecodeResult<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_varint(&mut self) -> DecodeResult<u64> {
        let mut value: u64 = 0;
        for i in 0..10 {
            let byte = self.read_u8()?;
            value |= u64::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(NativeSrvError::malformed("varint longer than 10 bytes").into())
    }

    pub fn read_varint_usize(&mut self) -> DecodeResult<usize> {
        let v = self.read_varint()?;
        usize::try_from(v)
            .map_err(|_| NativeSrvError::malformed(format!("length {v} out of range")).into())
    }

    /// Read a length prefixed byte string.
    pub fn read_binary(&mut self) -> DecodeResult<&'a [u8]> {
        let len = self.read_varint()?;
        if len > MAX_STRING_SIZE {
            return Err(NativeSrvError::malformed(format!("string of size {len} is too large")).into());
        }
        self.read_bytes(len as usize)
    }

    /// Read a length prefixed utf8 string.
    pub fn read_string(&mut self) -> DecodeResult<String> {
        let bytes = self.read_binary()?;
        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_string()),
            Err(e) => Err(NativeSrvError::malformed(format!("invalid utf8 in string: {e}")).into()),
        }
    }

    pub fn read_uuid(&mut self) -> DecodeResult<Uuid> {
        let high = self.read_u64_le()?;
        let low = self.read_u64_le()?;
        Ok(Uuid::from_u64_pair(high, low))
    }

    pub fn read_uuids(&mut self) -> DecodeResult<Vec<Uuid>> {
        let count = self.read_varint_usize()?;
        let mut uuids = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            uuids.push(self.read_uuid()?);
        }
        Ok(uuids)
    }
}

/// Extension methods for writing protocol primitives.
pub trait WireBufMut: BufMut {
    fn put_varint(&mut self, v: u64);

    /// Put a length prefixed byte string.
    fn put_binary(&mut self, b: &[u8]);

    fn put_string(&mut self, s: &str) {
        self.put_binary(s.as_bytes());
    }

    fn put_bool(&mut self, b: bool);

    fn put_uuid(&mut self, uuid: &Uuid);

    fn put_uuids(&mut self, uuids: &[Uuid]) {
        self.put_varint(uuids.len() as u64);
        for uuid in uuids {
            self.put_uuid(uuid);
        }
    }
}

impl<B: BufMut> WireBufMut for B {
    fn put_varint(&mut self, mut v: u64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.put_u8(byte);
                return;
            }
            self.put_u8(byte | 0x80);
        }
    }

    fn put_binary(&mut self, b: &[u8]) {
        self.put_varint(b.len() as u64);
        self.put_slice(b);
    }

    fn put_bool(&mut self, b: bool) {
        self.put_u8(b as u8);
    }

    fn put_uuid(&mut self, uuid: &Uuid) {
        let (high, low) = uuid.as_u64_pair();
        self.put_u64_le(high);
        self.put_u64_le(low);
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn varint_boundaries() {
        let cases: &[(u64, &[u8])] = &[
            (0, &[0x00]),
            (127, &[0x7f]),
            (128, &[0x80, 0x01]),
            (300, &[0xac, 0x02]),
            (54471, &[0xc7, 0xa9, 0x03]),
        ];

        for (value, expected) in cases {
            let mut buf = BytesMut::new();
            buf.put_varint(*value);
            assert_eq!(*expected, &buf[..], "encoding {value}");

            let mut r = WireReader::new(expected);
            assert_eq!(*value, r.read_varint().unwrap());
            assert!(r.is_empty());
        }

        let mut buf = BytesMut::new();
        buf.put_varint(u64::MAX);
        assert_eq!(10, buf.len());
        assert_eq!(u64::MAX, WireReader::new(&buf).read_varint().unwrap());
    }

    #[test]
    fn partial_reads_are_incomplete() {
        let mut buf = BytesMut::new();
        buf.put_string("hello");

        let mut r = WireReader::new(&buf[..3]);
        assert!(matches!(r.read_string(), Err(DecodeError::Incomplete)));

        let mut r = WireReader::new(&[0x80]);
        assert!(matches!(r.read_varint(), Err(DecodeError::Incomplete)));
    }

    #[test]
    fn overlong_varint_is_invalid() {
        let bytes = [0xff; 11];
        let mut r = WireReader::new(&bytes);
        assert!(matches!(r.read_varint(), Err(DecodeError::Invalid(_))));
    }

    #[test]
    fn invalid_utf8_string() {
        let mut buf = BytesMut::new();
        buf.put_binary(&[0xff, 0xfe]);
        let mut r = WireReader::new(&buf);
        assert!(matches!(r.read_string(), Err(DecodeError::Invalid(_))));
    }

    #[test]
    fn uuid_pair_order() {
        let uuid = Uuid::from_u64_pair(1, 2);
        let mut buf = BytesMut::new();
        buf.put_uuid(&uuid);
        assert_eq!(1, u64::from_le_bytes(buf[0..8].try_into().unwrap()));
        assert_eq!(uuid, WireReader::new(&buf).read_uuid().unwrap());
    }
}
