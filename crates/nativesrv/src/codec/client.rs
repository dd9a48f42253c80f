use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::{decode_packet, encode_packet};
use crate::compression::CompressionMethod;
use crate::errors::{NativeSrvError, Result};
use crate::messages::{Addendum, ClientPacket, ClusterNameAndSalt, ServerPacket};
use crate::protocol::Compression;

/// Client side codec, mirroring [`super::server::ServerCodec`].
#[derive(Debug, Clone)]
pub struct ClientCodec {
    /// Revision used for decoding. Before the server's hello is received this
    /// is the client's own revision.
    revision: u64,
    send_chunked: bool,
    recv_chunked: bool,
    send_compression: Option<CompressionMethod>,
    recv_compression: Compression,
}

impl ClientCodec {
    pub fn new(revision: u64) -> Self {
        ClientCodec {
            revision,
            send_chunked: false,
            recv_chunked: false,
            send_compression: None,
            recv_compression: Compression::Disabled,
        }
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

    /// Set the compression used for a query in both directions.
    pub fn set_compression(&mut self, method: Option<CompressionMethod>) {
        self.send_compression = method;
        self.recv_compression = match method {
            Some(_) => Compression::Enabled,
            None => Compression::Disabled,
        };
    }
}

impl Encoder<ClientPacket> for ClientCodec {
    type Error = NativeSrvError;

    fn encode(&mut self, item: ClientPacket, dst: &mut BytesMut) -> Result<()> {
        let (rev, compression) = (self.revision, self.send_compression);
        // The hello always precedes chunking.
        let chunked = self.send_chunked && !matches!(item, ClientPacket::Hello(_));
        encode_packet(dst, chunked, |buf| item.encode(buf, rev, compression));
        Ok(())
    }
}

impl Encoder<Addendum> for ClientCodec {
    type Error = NativeSrvError;

    fn encode(&mut self, item: Addendum, dst: &mut BytesMut) -> Result<()> {
        item.encode(dst, self.revision);
        Ok(())
    }
}

impl Encoder<ClusterNameAndSalt> for ClientCodec {
    type Error = NativeSrvError;

    fn encode(&mut self, item: ClusterNameAndSalt, dst: &mut BytesMut) -> Result<()> {
        item.encode(dst);
        Ok(())
    }
}

impl Decoder for ClientCodec {
    type Item = ServerPacket;
    type Error = NativeSrvError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let (rev, compression) = (self.revision, self.recv_compression);
        decode_packet(src, self.recv_chunked, |r| {
            ServerPacket::decode(r, rev, compression)
        })
    }
}
