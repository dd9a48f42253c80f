use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::{decode_packet, encode_packet};
use crate::compression::CompressionMethod;
use crate::errors::{NativeSrvError, Result};
use crate::messages::{ClientPacket, ServerPacket};
use crate::protocol::Compression;

/// Server side codec used once the handshake is complete.
///
/// The read and write halves of a connection each hold their own instance,
/// so only the fields for the relevant direction matter.
#[derive(Debug, Clone, Default)]
pub struct ServerCodec {
    revision: u64,
    send_chunked: bool,
    recv_chunked: bool,
    /// Compression of outgoing Data, Totals and Extremes blocks.
    send_compression: Option<CompressionMethod>,
    /// Whether incoming Data and Scalar blocks are compressed.
    recv_compression: Compression,
}

impl ServerCodec {
    pub fn new(revision: u64) -> Self {
        ServerCodec {
            revision,
            ..Default::default()
        }
    }

    pub fn with_chunked(mut self, send: bool, recv: bool) -> Self {
        self.send_chunked = send;
        self.recv_chunked = recv;
        self
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    pub fn set_chunked(&mut self, send: bool, recv: bool) {
        self.send_chunked = send;
        self.recv_chunked = recv;
    }

    pub fn set_send_compression(&mut self, compression: Option<CompressionMethod>) {
        self.send_compression = compression;
    }

    pub fn set_recv_compression(&mut self, compression: Compression) {
        self.recv_compression = compression;
    }

    pub fn recv_compression(&self) -> Compression {
        self.recv_compression
    }
}

impl Encoder<ServerPacket> for ServerCodec {
    type Error = NativeSrvError;

    fn encode(&mut self, item: ServerPacket, dst: &mut BytesMut) -> Result<()> {
        let (rev, compression) = (self.revision, self.send_compression);
        encode_packet(dst, self.send_chunked, |buf| item.encode(buf, rev, compression));
        Ok(())
    }
}

impl Decoder for ServerCodec {
    type Item = ClientPacket;
    type Error = NativeSrvError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let (rev, compression) = (self.revision, self.recv_compression);
        decode_packet(src, self.recv_chunked, |r| {
            ClientPacket::decode(r, rev, compression)
        })
    }
}
