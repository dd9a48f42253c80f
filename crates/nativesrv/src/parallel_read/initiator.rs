use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use super::coordinator::ParallelReadCoordinator;
use crate::client::{Absorbed, NativeClient, QueryResult};
use crate::errors::{NativeSrvError, Result};
use crate::messages::{ClientPacket, ServerPacket};
use crate::protocol::QueryKind;

/// Tasks of a cluster table function, handed to whichever replica asks
/// first.
#[derive(Debug, Default)]
pub struct ReadTaskQueue {
    tasks: Mutex<VecDeque<String>>,
}

impl ReadTaskQueue {
    pub fn new(tasks: impl IntoIterator<Item = String>) -> Self {
        ReadTaskQueue {
            tasks: Mutex::new(tasks.into_iter().collect()),
        }
    }

    /// Next task. Empty once everything was handed out.
    pub fn next_task(&self) -> String {
        self.tasks.lock().pop_front().unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.tasks.lock().len()
    }
}

/// The initiator's end of a connection to one reading replica.
///
/// Sends the replica its part of a query, then serves the replica's
/// announcements and range requests from the shared coordinator while
/// collecting the result.
#[derive(Debug)]
pub struct InitiatorLink<C> {
    client: NativeClient<C>,
    coordinator: Arc<ParallelReadCoordinator>,
    tasks: Option<Arc<ReadTaskQueue>>,
    replica_num: u64,
}

impl<C> InitiatorLink<C>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        client: NativeClient<C>,
        coordinator: Arc<ParallelReadCoordinator>,
        replica_num: u64,
    ) -> Self {
        InitiatorLink {
            client,
            coordinator,
            tasks: None,
            replica_num,
        }
    }

    /// Answer string read task requests from `tasks`.
    pub fn with_tasks(mut self, tasks: Arc<ReadTaskQueue>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn into_client(self) -> NativeClient<C> {
        self.client
    }

    /// Run `query` on the replica as one of `replicas` participants.
    ///
    /// If the replica fails, whatever it was assigned goes back to the
    /// coordinator for the other replicas.
    pub async fn run(&mut self, query: &str, replicas: u64) -> Result<QueryResult> {
        let res = self.run_inner(query, replicas).await;
        if let Err(e) = &res {
            debug!(replica = self.replica_num, %e, "replica failed, returning its ranges");
            self.coordinator.report_failure(self.replica_num);
        }
        res
    }

    async fn run_inner(&mut self, query: &str, replicas: u64) -> Result<QueryResult> {
        let mut packet = self.client.query_packet(query);
        packet.client_info.query_kind = QueryKind::SecondaryQuery;
        packet.client_info.collaborate_with_initiator = true;
        packet.client_info.count_participating_replicas = replicas;
        packet.client_info.number_of_current_replica = self.replica_num;
        self.client.send_query(packet).await?;

        let mut result = QueryResult::default();
        loop {
            let packet = self.client.receive().await?;
            let packet = match result.absorb(packet)? {
                Absorbed::Continue => continue,
                Absorbed::EndOfStream => return Ok(result),
                Absorbed::Other(packet) => packet,
            };
            match packet {
                ServerPacket::MergeTreeAllRangesAnnouncement(announcement) => {
                    trace!(replica = announcement.replica_num, "received announcement");
                    self.coordinator.handle_announcement(announcement)?;
                }
                ServerPacket::MergeTreeReadTaskRequest(request) => {
                    let response = self.coordinator.handle_request(request)?;
                    self.client
                        .send(ClientPacket::MergeTreeReadTaskResponse(response))
                        .await?;
                }
                ServerPacket::ReadTaskRequest => {
                    let task = self
                        .tasks
                        .as_ref()
                        .map(|tasks| tasks.next_task())
                        .unwrap_or_default();
                    self.client
                        .send(ClientPacket::ReadTaskResponse(task))
                        .await?;
                }
                other => {
                    return Err(NativeSrvError::malformed(format!(
                        "unexpected {} packet from replica",
                        other.name()
                    )));
                }
            }
        }
    }
}
