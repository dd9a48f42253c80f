use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

use crate::codec::server::ServerCodec;
use crate::errors::{NativeSrvError, Result};
use crate::messages::ClientPacket;
use crate::timeouts::ConnectionTimeouts;

pub type BoxedRead = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// Read half of a connection once the handshake is done.
pub struct PacketReader {
    framed: FramedRead<BoxedRead, ServerCodec>,
    timeouts: Arc<ConnectionTimeouts>,
}

impl fmt::Debug for PacketReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketReader")
            .field("codec", self.framed.decoder())
            .finish_non_exhaustive()
    }
}

impl PacketReader {
    pub fn new(framed: FramedRead<BoxedRead, ServerCodec>, timeouts: Arc<ConnectionTimeouts>) -> Self {
        PacketReader { framed, timeouts }
    }

    /// Wait for the next packet with no deadline. Returns `None` once the
    /// client closed the connection.
    ///
    /// Cancel safe, partially received packets stay buffered.
    pub async fn next(&mut self) -> Result<Option<ClientPacket>> {
        self.framed.next().await.transpose()
    }

    /// Next packet, failing if the client stays silent for longer than the
    /// receive timeout.
    pub async fn next_timed(&mut self) -> Result<ClientPacket> {
        let timeout = self.timeouts.receive();
        match tokio::time::timeout(timeout, self.framed.next()).await {
            Ok(Some(packet)) => packet,
            Ok(None) => Err(NativeSrvError::ConnectionClosed),
            Err(_) => Err(NativeSrvError::Timeout {
                op: "receiving data from client",
                timeout,
            }),
        }
    }

    pub fn codec(&self) -> &ServerCodec {
        self.framed.decoder()
    }

    pub fn codec_mut(&mut self) -> &mut ServerCodec {
        self.framed.decoder_mut()
    }
}
