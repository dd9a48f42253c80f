//! Chunked packet framing.
//!
//! When negotiated, every packet is split into chunks of
//! `| size (u32 LE) | bytes |`, and the end of a packet is marked by a chunk
//! of size zero.

use bytes::{Buf, BufMut, BytesMut};

use crate::errors::{NativeSrvError, Result};

/// Largest chunk we emit.
pub const MAX_CHUNK_SIZE: usize = 1 << 20;
/// Largest reassembled packet we accept.
pub const MAX_PACKET_SIZE: usize = 1 << 30;

/// Append `packet` to `dst` as a sequence of chunks plus the end marker.
pub fn write_chunked(packet: &[u8], dst: &mut BytesMut) {
    dst.reserve(packet.len() + 4 * (packet.len() / MAX_CHUNK_SIZE + 2));
    for chunk in packet.chunks(MAX_CHUNK_SIZE) {
        dst.put_u32_le(chunk.len() as u32);
        dst.put_slice(chunk);
    }
    dst.put_u32_le(0);
}

/// Take one complete chunked packet off the front of `src`.
///
/// Returns `None` without touching `src` if the end marker hasn't arrived
/// yet.
pub fn take_chunked(src: &mut BytesMut) -> Result<Option<BytesMut>> {
    let mut pos = 0;
    let mut payload_len = 0;
    loop {
        if src.len() < pos + 4 {
            return Ok(None);
        }
        let size = u32::from_le_bytes([src[pos], src[pos + 1], src[pos + 2], src[pos + 3]]) as usize;
        pos += 4;
        if size == 0 {
            break;
        }
        payload_len += size;
        if payload_len > MAX_PACKET_SIZE {
            return Err(NativeSrvError::malformed(format!(
                "chunked packet exceeds {MAX_PACKET_SIZE} bytes"
            )));
        }
        if src.len() < pos + size {
            src.reserve(pos + size - src.len());
            return Ok(None);
        }
        pos += size;
    }

    if payload_len == 0 {
        // Every packet carries at least its id.
        src.advance(pos);
        return Err(NativeSrvError::malformed("empty chunked packet"));
    }

    let mut out = BytesMut::with_capacity(payload_len);
    let mut framed = src.split_to(pos);
    loop {
        let size = framed.get_u32_le() as usize;
        if size == 0 {
            break;
        }
        out.extend_from_slice(&framed[..size]);
        framed.advance(size);
    }
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_packet() {
        let mut buf = BytesMut::new();
        write_chunked(b"hello", &mut buf);
        assert_eq!(4 + 5 + 4, buf.len());

        let packet = take_chunked(&mut buf).unwrap().unwrap();
        assert_eq!(&b"hello"[..], &packet[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn multi_chunk_packet_reassembles() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(3);
        buf.put_slice(b"abc");
        buf.put_u32_le(2);
        buf.put_slice(b"de");
        buf.put_u32_le(0);
        buf.put_slice(b"trailing");

        let packet = take_chunked(&mut buf).unwrap().unwrap();
        assert_eq!(&b"abcde"[..], &packet[..]);
        assert_eq!(&b"trailing"[..], &buf[..]);
    }

    #[test]
    fn waits_for_end_marker() {
        let mut full = BytesMut::new();
        write_chunked(b"0123456789", &mut full);

        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(take_chunked(&mut partial).unwrap().is_none(), "cut at {cut}");
            assert_eq!(cut, partial.len());
        }
    }

    #[test]
    fn large_packet_is_split() {
        let packet = vec![7u8; MAX_CHUNK_SIZE + 10];
        let mut buf = BytesMut::new();
        write_chunked(&packet, &mut buf);
        assert_eq!(packet.len() + 3 * 4, buf.len());
        assert_eq!(packet, &take_chunked(&mut buf).unwrap().unwrap()[..]);
    }
}
