//! Per query state of a connection.
//!
//! A connection runs at most one query at a time. What is known about that
//! query depends on its phase, so each phase carries only its own fields.

use std::sync::Arc;

use tracing::Span;
use uuid::Uuid;

use crate::block::Block;
use crate::engine::{InputFeed, QueryContext};
use crate::logs::LogsRegistration;
use crate::messages::ClientPacket;
use crate::profile_events::ProfileEventsSender;
use crate::protocol::{Compression, QueryProcessingStage};
use crate::timeouts::TimeoutSetter;

/// Packets a client may send ahead of its query.
#[derive(Debug, Default, PartialEq)]
pub struct QueryPrelude {
    pub ignored_part_uuids: Option<Vec<Uuid>>,
    pub scalars: Vec<(String, Block)>,
}

impl QueryPrelude {
    pub fn is_empty(&self) -> bool {
        self.ignored_part_uuids.is_none() && self.scalars.is_empty()
    }
}

/// Data common to every phase of a running query.
#[derive(Debug)]
pub struct ActiveQuery {
    pub query_id: String,
    pub stage: QueryProcessingStage,
    /// Compression of this query's blocks, in both directions.
    pub compression: Compression,
    pub ctx: Arc<QueryContext>,
    /// Keeps log forwarding for this query alive.
    pub logs: Option<LogsRegistration>,
    pub profile_events: ProfileEventsSender,
    pub span: Span,
    pub timeout_setter: Option<TimeoutSetter>,
    /// The client went away while the query ran.
    pub is_connection_closed: bool,
}

impl ActiveQuery {
    pub fn new(ctx: Arc<QueryContext>, compression: Compression, span: Span) -> Self {
        ActiveQuery {
            query_id: ctx.query_id.clone(),
            stage: ctx.stage,
            compression,
            ctx,
            logs: None,
            profile_events: ProfileEventsSender::default(),
            span,
            timeout_setter: None,
            is_connection_closed: false,
        }
    }
}

#[derive(Debug)]
pub struct InsertState {
    pub query: ActiveQuery,
    /// The header was sent, so the client may be sending data.
    pub header_sent: bool,
    /// The client's end of data marker was received.
    pub read_all_data: bool,
    /// Data packets are discarded until the end of data marker.
    pub skipping_data: bool,
}

#[derive(Debug)]
pub struct ExecutingState {
    pub query: ActiveQuery,
    /// Where client data goes for queries reading from `input()`.
    pub input: Option<InputFeed>,
    pub sent_all_data: bool,
}

#[derive(Debug)]
pub enum QueryState {
    AwaitingQuery(QueryPrelude),
    ReceivingInsert(Box<InsertState>),
    Executing(Box<ExecutingState>),
    Completed,
}

impl Default for QueryState {
    fn default() -> Self {
        QueryState::AwaitingQuery(QueryPrelude::default())
    }
}

/// What to do with a packet given the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDisposition {
    StartQuery,
    InsertData,
    InputData,
    Scalar,
    Cancel,
    Ping,
    TablesStatus,
    IgnoredPartUuids,
    ReadTaskResponse,
    /// Consume and drop.
    Discard,
    /// Valid, but nothing to do.
    Ignore,
    /// Not valid now, the payload names the state.
    Unexpected(&'static str),
}

impl QueryState {
    pub fn reset(&mut self) {
        *self = QueryState::default();
    }

    pub fn is_default(&self) -> bool {
        matches!(self, QueryState::AwaitingQuery(prelude) if prelude.is_empty())
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::ReceivingInsert(_) | Self::Executing(_))
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::AwaitingQuery(_) => "waiting for a query",
            Self::ReceivingInsert(_) => "receiving data for an insert",
            Self::Executing(_) => "executing a query",
            Self::Completed => "finishing a query",
        }
    }

    pub fn active_query(&self) -> Option<&ActiveQuery> {
        match self {
            Self::ReceivingInsert(state) => Some(&state.query),
            Self::Executing(state) => Some(&state.query),
            _ => None,
        }
    }

    pub fn active_query_mut(&mut self) -> Option<&mut ActiveQuery> {
        match self {
            Self::ReceivingInsert(state) => Some(&mut state.query),
            Self::Executing(state) => Some(&mut state.query),
            _ => None,
        }
    }

    /// Take what the client sent ahead of its query, leaving an empty
    /// prelude.
    pub fn take_prelude(&mut self) -> QueryPrelude {
        match self {
            Self::AwaitingQuery(prelude) => std::mem::take(prelude),
            _ => QueryPrelude::default(),
        }
    }

    /// Whether an error now leaves client data in flight that has to be
    /// skipped.
    pub fn has_unread_insert_data(&self) -> bool {
        matches!(self, Self::ReceivingInsert(state) if state.header_sent && !state.read_all_data)
    }

    pub fn classify(&self, packet: &ClientPacket) -> PacketDisposition {
        let unexpected = PacketDisposition::Unexpected(self.describe());
        match packet {
            ClientPacket::Ping => PacketDisposition::Ping,
            ClientPacket::KeepAlive => PacketDisposition::Ignore,
            ClientPacket::Cancel => {
                if self.is_active() {
                    PacketDisposition::Cancel
                } else {
                    PacketDisposition::Ignore
                }
            }
            ClientPacket::Query(_) => match self {
                Self::AwaitingQuery(_) => PacketDisposition::StartQuery,
                _ => unexpected,
            },
            ClientPacket::Data(data) => match self {
                Self::ReceivingInsert(state) if state.skipping_data => PacketDisposition::Discard,
                Self::ReceivingInsert(state) if state.header_sent && !state.read_all_data => {
                    PacketDisposition::InsertData
                }
                Self::Executing(state) if state.input.is_some() => PacketDisposition::InputData,
                // End of external tables, sent by some clients after every
                // query.
                Self::Executing(_) if data.block.is_empty() => PacketDisposition::Discard,
                _ => unexpected,
            },
            ClientPacket::Scalar(_) => match self {
                Self::AwaitingQuery(_) | Self::ReceivingInsert(_) => PacketDisposition::Scalar,
                _ => unexpected,
            },
            ClientPacket::TablesStatusRequest(_) => match self {
                Self::AwaitingQuery(_) => PacketDisposition::TablesStatus,
                _ => unexpected,
            },
            ClientPacket::IgnoredPartUuids(_) => match self {
                Self::AwaitingQuery(_) => PacketDisposition::IgnoredPartUuids,
                _ => unexpected,
            },
            ClientPacket::ReadTaskResponse(_) | ClientPacket::MergeTreeReadTaskResponse(_) => {
                match self {
                    Self::Executing(_) => PacketDisposition::ReadTaskResponse,
                    _ => unexpected,
                }
            }
            ClientPacket::Hello(_)
            | ClientPacket::SshChallengeRequest
            | ClientPacket::SshChallengeResponse(_) => unexpected,
        }
    }
}

/// Input parameters of the previous query, used to decode data a client
/// sends after its query failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LastBlockInputParameters {
    pub compression: Compression,
}

#[cfg(test)]
mod tests {
    use crate::block::{Column, DataType};
    use crate::messages::{DataPacket, QueryPacket, TablesStatusRequest};

    use super::*;

    fn active() -> ActiveQuery {
        let ctx = Arc::new(QueryContext::new("q", "INSERT INTO t VALUES"));
        ActiveQuery::new(ctx, Compression::Enabled, Span::none())
    }

    fn inserting(header_sent: bool, skipping_data: bool) -> QueryState {
        QueryState::ReceivingInsert(Box::new(InsertState {
            query: active(),
            header_sent,
            read_all_data: false,
            skipping_data,
        }))
    }

    fn data(rows: usize) -> ClientPacket {
        if rows == 0 {
            return ClientPacket::Data(DataPacket::end());
        }
        let values: Vec<u64> = (0..rows as u64).collect();
        ClientPacket::Data(DataPacket::new(Block::new(vec![Column::new("a", values)])))
    }

    #[test]
    fn reset_restores_default() {
        let mut state = inserting(true, false);
        assert!(!state.is_default());
        state.reset();
        assert!(state.is_default());

        let mut state = QueryState::AwaitingQuery(QueryPrelude {
            ignored_part_uuids: Some(vec![Uuid::from_u128(7)]),
            scalars: Vec::new(),
        });
        assert!(!state.is_default());
        let prelude = state.take_prelude();
        assert_eq!(Some(vec![Uuid::from_u128(7)]), prelude.ignored_part_uuids);
        assert!(state.is_default());
    }

    #[test]
    fn classify_while_idle() {
        let state = QueryState::default();
        let query = ClientPacket::Query(Box::new(QueryPacket::new("SELECT 1")));
        assert_eq!(PacketDisposition::StartQuery, state.classify(&query));
        assert_eq!(PacketDisposition::Ping, state.classify(&ClientPacket::Ping));
        assert_eq!(PacketDisposition::Ignore, state.classify(&ClientPacket::Cancel));
        assert_eq!(
            PacketDisposition::TablesStatus,
            state.classify(&ClientPacket::TablesStatusRequest(
                TablesStatusRequest::default()
            ))
        );
        assert!(matches!(
            state.classify(&data(3)),
            PacketDisposition::Unexpected(_)
        ));
        assert!(matches!(
            state.classify(&ClientPacket::ReadTaskResponse("x".to_string())),
            PacketDisposition::Unexpected(_)
        ));
    }

    #[test]
    fn classify_while_inserting() {
        let state = inserting(true, false);
        assert_eq!(PacketDisposition::InsertData, state.classify(&data(3)));
        assert_eq!(PacketDisposition::Cancel, state.classify(&ClientPacket::Cancel));
        let query = ClientPacket::Query(Box::new(QueryPacket::new("SELECT 1")));
        assert_eq!(
            PacketDisposition::Unexpected("receiving data for an insert"),
            state.classify(&query)
        );
        assert!(state.has_unread_insert_data());

        let state = inserting(true, true);
        assert_eq!(PacketDisposition::Discard, state.classify(&data(3)));
        assert_eq!(PacketDisposition::Discard, state.classify(&data(0)));

        // Nothing was asked for yet.
        let state = inserting(false, false);
        assert!(matches!(
            state.classify(&data(3)),
            PacketDisposition::Unexpected(_)
        ));
        assert!(!state.has_unread_insert_data());
    }

    #[test]
    fn classify_while_executing() {
        let mut exec = ExecutingState {
            query: active(),
            input: None,
            sent_all_data: false,
        };
        let state = QueryState::Executing(Box::new(exec));
        assert_eq!(PacketDisposition::Discard, state.classify(&data(0)));
        assert!(matches!(
            state.classify(&data(2)),
            PacketDisposition::Unexpected(_)
        ));
        assert_eq!(
            PacketDisposition::ReadTaskResponse,
            state.classify(&ClientPacket::ReadTaskResponse("task".to_string()))
        );

        let QueryState::Executing(boxed) = state else {
            unreachable!()
        };
        exec = *boxed;
        let ctx = exec.query.ctx.clone();
        let _reader = ctx
            .take_input(Block::header([("a", DataType::UInt64)]))
            .unwrap();
        exec.input = ctx.take_input_feed();
        let state = QueryState::Executing(Box::new(exec));
        assert_eq!(PacketDisposition::InputData, state.classify(&data(2)));
    }
}
