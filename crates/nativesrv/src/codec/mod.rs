//! Framing of packets on the wire.
//!
//! Packets are either written back to back, or, when chunked mode has been
//! negotiated for a direction, wrapped in chunks (see [`chunked`]).

pub mod chunked;
pub mod client;
pub mod handshake;
pub mod server;
pub mod wire;

use bytes::{Buf, BytesMut};

use crate::errors::{NativeSrvError, Result};
use wire::{DecodeError, DecodeResult, WireReader};

/// Decode a single packet from `src` using `f`.
///
/// In plain mode the packet is parsed in place and `src` is only advanced
/// once the whole packet is present. In chunked mode the packet is first
/// reassembled, and must then be consumed exactly.
fn decode_packet<T>(
    src: &mut BytesMut,
    chunked: bool,
    f: impl FnOnce(&mut WireReader<'_>) -> DecodeResult<T>,
) -> Result<Option<T>> {
    if chunked {
        let Some(packet) = chunked::take_chunked(src)? else {
            return Ok(None);
        };
        let mut r = WireReader::new(&packet);
        let item = wire::complete(f(&mut r))?;
        if !r.is_empty() {
            return Err(NativeSrvError::malformed(format!(
                "{} unread bytes at end of chunked packet",
                r.remaining()
            )));
        }
        return Ok(Some(item));
    }

    let mut r = WireReader::new(src);
    match f(&mut r) {
        Ok(item) => {
            let n = r.position();
            src.advance(n);
            Ok(Some(item))
        }
        Err(DecodeError::Incomplete) => Ok(None),
        Err(DecodeError::Invalid(e)) => Err(e),
    }
}

/// Encode a single packet into `dst` using `f`.
fn encode_packet(dst: &mut BytesMut, chunked: bool, f: impl FnOnce(&mut BytesMut)) {
    if chunked {
        let mut packet = BytesMut::new();
        f(&mut packet);
        chunked::write_chunked(&packet, dst);
    } else {
        f(dst);
    }
}
