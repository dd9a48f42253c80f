use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::SinkExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use tracing::trace;

use crate::codec::server::ServerCodec;
use crate::errors::{NativeSrvError, Result};
use crate::messages::ServerPacket;
use crate::timeouts::ConnectionTimeouts;

pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of a connection, shared by the read loop and the tasks
/// running a query.
///
/// Every packet goes through the lock, so packets from different tasks never
/// interleave and are written in the order they were handed over.
#[derive(Clone)]
pub struct SharedWriter {
    inner: Arc<Mutex<FramedWrite<BoxedWrite, ServerCodec>>>,
    timeouts: Arc<ConnectionTimeouts>,
}

impl fmt::Debug for SharedWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedWriter").finish_non_exhaustive()
    }
}

impl SharedWriter {
    pub fn new<W>(write: W, codec: ServerCodec, timeouts: Arc<ConnectionTimeouts>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        SharedWriter {
            inner: Arc::new(Mutex::new(FramedWrite::new(Box::new(write), codec))),
            timeouts,
        }
    }

    pub async fn send(&self, packet: ServerPacket) -> Result<()> {
        self.send_all(vec![packet]).await
    }

    /// Send packets back to back, without anything else in between.
    pub async fn send_all(&self, packets: Vec<ServerPacket>) -> Result<()> {
        if packets.is_empty() {
            return Ok(());
        }
        let mut framed = self.inner.lock().await;
        self.with_timeout(async {
            for packet in packets {
                trace!(packet = packet.name(), "sending packet");
                framed.feed(packet).await?;
            }
            framed.flush().await
        })
        .await
    }

    /// Write bytes outside of any framing. Only used to answer clients that
    /// don't speak the protocol.
    pub async fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut framed = self.inner.lock().await;
        self.with_timeout(async {
            let w = framed.get_mut();
            w.write_all(bytes).await?;
            w.flush().await?;
            Ok(())
        })
        .await
    }

    /// Change how packets are encoded from now on.
    pub async fn configure(&self, f: impl FnOnce(&mut ServerCodec)) {
        let mut framed = self.inner.lock().await;
        f(framed.encoder_mut());
    }

    pub async fn shutdown(&self) -> Result<()> {
        let mut framed = self.inner.lock().await;
        framed.get_mut().shutdown().await?;
        Ok(())
    }

    async fn with_timeout<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.timeouts.send();
        match tokio::time::timeout(timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(NativeSrvError::Timeout {
                op: "sending data to client",
                timeout,
            }),
        }
    }
}
