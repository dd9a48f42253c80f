use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::trace;

use super::types::{InitialAllRangesAnnouncement, ParallelReadRequest, ParallelReadResponse};
use crate::cancel::QueryCallbacks;
use crate::errors::ExecError;
use crate::messages::ServerPacket;
use crate::writer::SharedWriter;

/// Lets a query running on this server pull read tasks from the peer that
/// sent it, over the same connection.
///
/// Requests go out through the connection's writer. Responses are picked up
/// by the connection's read loop and routed back through the query's
/// callbacks, so waiting for one never holds the write lock.
#[derive(Debug)]
pub struct ReadTaskChannel {
    writer: SharedWriter,
    callbacks: Arc<QueryCallbacks>,
    announced: AtomicBool,
    /// Serializes pulls so responses match requests in order.
    pulls: Mutex<()>,
}

impl ReadTaskChannel {
    pub fn new(writer: SharedWriter, callbacks: Arc<QueryCallbacks>) -> Self {
        ReadTaskChannel {
            writer,
            callbacks,
            announced: AtomicBool::new(false),
            pulls: Mutex::new(()),
        }
    }

    /// Send the ranges this replica can read. Allowed once per query.
    pub async fn announce(&self, announcement: InitialAllRangesAnnouncement) -> Result<(), ExecError> {
        if self.announced.swap(true, Ordering::SeqCst) {
            return Err(ExecError::logical("ranges were already announced for this query"));
        }
        trace!(replica = announcement.replica_num, "announcing ranges");
        self.writer
            .send(ServerPacket::MergeTreeAllRangesAnnouncement(announcement))
            .await?;
        Ok(())
    }

    /// Ask for the next ranges to read. Returns `None` if the query was
    /// cancelled while waiting.
    pub async fn request(
        &self,
        request: ParallelReadRequest,
    ) -> Result<Option<ParallelReadResponse>, ExecError> {
        if !self.announced.load(Ordering::SeqCst) {
            return Err(ExecError::logical(
                "ranges must be announced before requesting any",
            ));
        }
        let _turn = self.pulls.lock().await;
        let Some(rx) = self.callbacks.wait_parallel_response() else {
            return Ok(None);
        };
        self.writer
            .send(ServerPacket::MergeTreeReadTaskRequest(request))
            .await?;
        // The sender is dropped on full cancellation.
        Ok(rx.await.ok())
    }

    /// Ask for the next task of a cluster table function.
    pub async fn next_task(&self) -> Result<Option<String>, ExecError> {
        let _turn = self.pulls.lock().await;
        let Some(rx) = self.callbacks.wait_task_response() else {
            return Ok(None);
        };
        self.writer.send(ServerPacket::ReadTaskRequest).await?;
        Ok(rx.await.ok())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use tokio::io::DuplexStream;
    use tokio_util::codec::FramedRead;

    use super::*;
    use crate::cancel::CancellationStatus;
    use crate::codec::client::ClientCodec;
    use crate::codec::server::ServerCodec;
    use crate::parallel_read::types::{CoordinationMode, RangesInDataPartsDescription};
    use crate::protocol::revision;
    use crate::timeouts::ConnectionTimeouts;

    fn setup() -> (
        Arc<ReadTaskChannel>,
        Arc<QueryCallbacks>,
        FramedRead<DuplexStream, ClientCodec>,
    ) {
        let (client, server) = tokio::io::duplex(4096);
        let timeouts = Arc::new(ConnectionTimeouts::new(
            Duration::from_secs(5),
            Duration::from_secs(5),
        ));
        let writer = SharedWriter::new(server, ServerCodec::new(revision::SERVER), timeouts);
        let callbacks = Arc::new(QueryCallbacks::default());
        let channel = Arc::new(ReadTaskChannel::new(writer, callbacks.clone()));
        let client = FramedRead::new(client, ClientCodec::new(revision::SERVER));
        (channel, callbacks, client)
    }

    fn announcement() -> InitialAllRangesAnnouncement {
        InitialAllRangesAnnouncement {
            mode: CoordinationMode::Default,
            description: RangesInDataPartsDescription::default(),
            replica_num: 1,
        }
    }

    fn request() -> ParallelReadRequest {
        ParallelReadRequest {
            mode: CoordinationMode::Default,
            replica_num: 1,
            min_number_of_marks: 8,
            description: RangesInDataPartsDescription::default(),
        }
    }

    #[tokio::test]
    async fn request_waits_for_routed_response() {
        let (channel, callbacks, mut client) = setup();
        channel.announce(announcement()).await.unwrap();
        channel.announce(announcement()).await.unwrap_err();

        let pull = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request(request()).await })
        };

        assert!(matches!(
            client.next().await.unwrap().unwrap(),
            ServerPacket::MergeTreeAllRangesAnnouncement(_)
        ));
        assert_eq!(
            ServerPacket::MergeTreeReadTaskRequest(request()),
            client.next().await.unwrap().unwrap()
        );

        assert!(callbacks.awaiting_parallel_response());
        assert!(callbacks.deliver_parallel_response(ParallelReadResponse::finished()));
        let resp = pull.await.unwrap().unwrap();
        assert_eq!(Some(ParallelReadResponse::finished()), resp);
        assert!(!callbacks.awaiting_parallel_response());
    }

    #[tokio::test]
    async fn requests_require_announcement() {
        let (channel, _callbacks, _client) = setup();
        channel.request(request()).await.unwrap_err();
    }

    #[tokio::test]
    async fn full_cancellation_releases_pending_pulls() {
        let (channel, callbacks, mut client) = setup();
        let pull = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.next_task().await })
        };
        assert_eq!(ServerPacket::ReadTaskRequest, client.next().await.unwrap().unwrap());

        callbacks.lower_to(CancellationStatus::FullyCancelled);
        assert_eq!(None, pull.await.unwrap().unwrap());

        // No new pulls once cancelled.
        assert_eq!(None, channel.next_task().await.unwrap());
    }
}
