//! Typed packets and their bodies.
//!
//! Encoding of anything after the hello exchange depends on the negotiated
//! revision, and block-bearing packets additionally on the compression used
//! for the current query.

use std::fmt;

use bytes::BufMut;
use uuid::Uuid;

use crate::block::Block;
use crate::codec::wire::{DecodeError, DecodeResult, WireBufMut, WireReader};
use crate::compression::{self, CompressionMethod};
use crate::errors::NativeSrvError;
use crate::parallel_read::types::{
    InitialAllRangesAnnouncement, ParallelReadRequest, ParallelReadResponse,
};
use crate::protocol::{
    CLUSTER_PROCESSING_PROTOCOL_VERSION, ChunkedMode, ClientPacketId, Compression, Interface,
    QueryKind, QueryProcessingStage, ServerPacketId, revision,
};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientHello {
    pub client_name: String,
    pub version_major: u64,
    pub version_minor: u64,
    pub revision: u64,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl ClientHello {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_varint(ClientPacketId::Hello as u64);
        buf.put_string(&self.client_name);
        buf.put_varint(self.version_major);
        buf.put_varint(self.version_minor);
        buf.put_varint(self.revision);
        buf.put_string(&self.database);
        buf.put_string(&self.user);
        buf.put_string(&self.password);
    }

    /// Decode the hello body, the packet id has already been read.
    pub fn decode(r: &mut WireReader<'_>) -> DecodeResult<Self> {
        Ok(ClientHello {
            client_name: r.read_string()?,
            version_major: r.read_varint()?,
            version_minor: r.read_varint()?,
            revision: r.read_varint()?,
            database: r.read_string()?,
            user: r.read_string()?,
            password: r.read_string()?,
        })
    }
}

/// Metadata sent by the client after the server's hello.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Addendum {
    pub quota_key: String,
    /// Client's send and receive chunking preferences.
    pub chunked: Option<(ChunkedMode, ChunkedMode)>,
    pub parallel_replicas_protocol_version: Option<u64>,
}

impl Addendum {
    pub fn encode(&self, buf: &mut impl BufMut, rev: u64) {
        buf.put_string(&self.quota_key);
        if rev >= revision::CHUNKED_PACKETS {
            let (send, recv) = self.chunked.unwrap_or_default();
            buf.put_string(send.as_str());
            buf.put_string(recv.as_str());
        }
        if rev >= revision::VERSIONED_PARALLEL_REPLICAS {
            buf.put_varint(self.parallel_replicas_protocol_version.unwrap_or_default());
        }
    }

    pub fn decode(r: &mut WireReader<'_>, rev: u64) -> DecodeResult<Self> {
        let quota_key = r.read_string()?;
        let chunked = if rev >= revision::CHUNKED_PACKETS {
            let send: ChunkedMode = r.read_string()?.parse()?;
            let recv: ChunkedMode = r.read_string()?.parse()?;
            Some((send, recv))
        } else {
            None
        };
        let parallel_replicas_protocol_version = if rev >= revision::VERSIONED_PARALLEL_REPLICAS {
            Some(r.read_varint()?)
        } else {
            None
        };
        Ok(Addendum {
            quota_key,
            chunked,
            parallel_replicas_protocol_version,
        })
    }
}

/// Sent right after the hello by a replica using the inter-server secret.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClusterNameAndSalt {
    pub cluster: String,
    pub salt: String,
}

impl ClusterNameAndSalt {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_string(&self.cluster);
        buf.put_string(&self.salt);
    }

    pub fn decode(r: &mut WireReader<'_>) -> DecodeResult<Self> {
        Ok(ClusterNameAndSalt {
            cluster: r.read_string()?,
            salt: r.read_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TraceContext {
    pub trace_id: u128,
    pub span_id: u64,
    pub tracestate: String,
    pub trace_flags: u8,
}

/// Information about the client and the query's origin, sent with every
/// query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientInfo {
    pub query_kind: QueryKind,
    pub initial_user: String,
    pub initial_query_id: String,
    pub initial_address: String,
    pub initial_query_start_time_us: u64,
    pub interface: Interface,
    pub os_user: String,
    pub client_hostname: String,
    pub client_name: String,
    pub client_version_major: u64,
    pub client_version_minor: u64,
    pub client_version_patch: u64,
    pub client_revision: u64,
    pub quota_key: String,
    pub distributed_depth: u64,
    pub trace_context: Option<TraceContext>,
    pub collaborate_with_initiator: bool,
    pub count_participating_replicas: u64,
    pub number_of_current_replica: u64,
}

impl ClientInfo {
    pub fn encode(&self, buf: &mut impl BufMut, rev: u64) {
        buf.put_u8(self.query_kind as u8);
        if self.query_kind == QueryKind::NoQuery {
            return;
        }

        buf.put_string(&self.initial_user);
        buf.put_string(&self.initial_query_id);
        buf.put_string(&self.initial_address);
        if rev >= revision::INITIAL_QUERY_START_TIME {
            buf.put_u64_le(self.initial_query_start_time_us);
        }

        buf.put_u8(self.interface as u8);
        if self.interface == Interface::Tcp {
            buf.put_string(&self.os_user);
            buf.put_string(&self.client_hostname);
            buf.put_string(&self.client_name);
            buf.put_varint(self.client_version_major);
            buf.put_varint(self.client_version_minor);
            buf.put_varint(self.client_revision);
        }

        if rev >= revision::QUOTA_KEY_IN_CLIENT_INFO {
            buf.put_string(&self.quota_key);
        }
        if rev >= revision::DISTRIBUTED_DEPTH {
            buf.put_varint(self.distributed_depth);
        }
        if rev >= revision::VERSION_PATCH && self.interface == Interface::Tcp {
            buf.put_varint(self.client_version_patch);
        }
        if rev >= revision::OPENTELEMETRY {
            match &self.trace_context {
                Some(trace) => {
                    buf.put_u8(1);
                    buf.put_u64_le(trace.trace_id as u64);
                    buf.put_u64_le((trace.trace_id >> 64) as u64);
                    buf.put_u64_le(trace.span_id);
                    buf.put_string(&trace.tracestate);
                    buf.put_u8(trace.trace_flags);
                }
                None => buf.put_u8(0),
            }
        }
        if rev >= revision::PARALLEL_REPLICAS {
            buf.put_varint(self.collaborate_with_initiator as u64);
            buf.put_varint(self.count_participating_replicas);
            buf.put_varint(self.number_of_current_replica);
        }
    }

    pub fn decode(r: &mut WireReader<'_>, rev: u64) -> DecodeResult<Self> {
        let mut info = ClientInfo {
            query_kind: QueryKind::from_wire(r.read_u8()?)?,
            ..Default::default()
        };
        if info.query_kind == QueryKind::NoQuery {
            return Ok(info);
        }

        info.initial_user = r.read_string()?;
        info.initial_query_id = r.read_string()?;
        info.initial_address = r.read_string()?;
        if rev >= revision::INITIAL_QUERY_START_TIME {
            info.initial_query_start_time_us = r.read_u64_le()?;
        }

        info.interface = Interface::from_wire(r.read_u8()?)?;
        if info.interface == Interface::Tcp {
            info.os_user = r.read_string()?;
            info.client_hostname = r.read_string()?;
            info.client_name = r.read_string()?;
            info.client_version_major = r.read_varint()?;
            info.client_version_minor = r.read_varint()?;
            info.client_revision = r.read_varint()?;
        }

        if rev >= revision::QUOTA_KEY_IN_CLIENT_INFO {
            info.quota_key = r.read_string()?;
        }
        if rev >= revision::DISTRIBUTED_DEPTH {
            info.distributed_depth = r.read_varint()?;
        }
        if rev >= revision::VERSION_PATCH && info.interface == Interface::Tcp {
            info.client_version_patch = r.read_varint()?;
        }
        if rev >= revision::OPENTELEMETRY && r.read_u8()? != 0 {
            let low = r.read_u64_le()? as u128;
            let high = r.read_u64_le()? as u128;
            info.trace_context = Some(TraceContext {
                trace_id: low | (high << 64),
                span_id: r.read_u64_le()?,
                tracestate: r.read_string()?,
                trace_flags: r.read_u8()?,
            });
        }
        if rev >= revision::PARALLEL_REPLICAS {
            info.collaborate_with_initiator = r.read_varint()? != 0;
            info.count_participating_replicas = r.read_varint()?;
            info.number_of_current_replica = r.read_varint()?;
        }

        Ok(info)
    }
}

/// Setting flag: fail the query if the setting is unknown.
pub const SETTING_FLAG_IMPORTANT: u64 = 0x01;
/// Setting flag: user defined setting.
pub const SETTING_FLAG_CUSTOM: u64 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SettingChange {
    pub name: String,
    pub flags: u64,
    pub value: String,
}

impl SettingChange {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        SettingChange {
            name: name.into(),
            flags: 0,
            value: value.into(),
        }
    }

    pub fn important(mut self) -> Self {
        self.flags |= SETTING_FLAG_IMPORTANT;
        self
    }

    pub fn is_important(&self) -> bool {
        self.flags & SETTING_FLAG_IMPORTANT != 0
    }

    fn encode_list(changes: &[SettingChange], buf: &mut impl BufMut) {
        for change in changes {
            buf.put_string(&change.name);
            buf.put_varint(change.flags);
            buf.put_string(&change.value);
        }
        // Empty name terminates the list.
        buf.put_string("");
    }

    fn decode_list(r: &mut WireReader<'_>) -> DecodeResult<Vec<SettingChange>> {
        let mut changes = Vec::new();
        loop {
            let name = r.read_string()?;
            if name.is_empty() {
                return Ok(changes);
            }
            let flags = r.read_varint()?;
            let value = r.read_string()?;
            changes.push(SettingChange { name, flags, value });
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryPacket {
    pub query_id: String,
    pub client_info: ClientInfo,
    pub settings: Vec<SettingChange>,
    /// Inter-server hash, empty unless the connection uses a cluster secret.
    pub interserver_hash: Vec<u8>,
    pub stage: QueryProcessingStage,
    pub compression: Compression,
    pub query: String,
    pub parameters: Vec<SettingChange>,
}

impl QueryPacket {
    pub fn new(query: impl Into<String>) -> Self {
        QueryPacket {
            query: query.into(),
            ..Default::default()
        }
    }

    fn encode(&self, buf: &mut impl BufMut, rev: u64) {
        buf.put_string(&self.query_id);
        self.client_info.encode(buf, rev);
        SettingChange::encode_list(&self.settings, buf);
        if rev >= revision::INTERSERVER_SECRET {
            buf.put_binary(&self.interserver_hash);
        }
        buf.put_varint(self.stage as u64);
        buf.put_varint(self.compression.to_wire());
        buf.put_string(&self.query);
        if rev >= revision::PARAMETERS {
            SettingChange::encode_list(&self.parameters, buf);
        }
    }

    fn decode(r: &mut WireReader<'_>, rev: u64) -> DecodeResult<Self> {
        let query_id = r.read_string()?;
        let client_info = ClientInfo::decode(r, rev)?;
        let settings = SettingChange::decode_list(r)?;
        let interserver_hash = if rev >= revision::INTERSERVER_SECRET {
            r.read_binary()?.to_vec()
        } else {
            Vec::new()
        };
        let stage = QueryProcessingStage::from_wire(r.read_varint()?)?;
        let compression = Compression::from_wire(r.read_varint()?)?;
        let query = r.read_string()?;
        let parameters = if rev >= revision::PARAMETERS {
            SettingChange::decode_list(r)?
        } else {
            Vec::new()
        };
        Ok(QueryPacket {
            query_id,
            client_info,
            settings,
            interserver_hash,
            stage,
            compression,
            query,
            parameters,
        })
    }
}

/// A block sent by the client, either insert data or a scalar.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataPacket {
    pub table_name: String,
    pub block: Block,
}

impl DataPacket {
    pub fn new(block: Block) -> Self {
        DataPacket {
            table_name: String::new(),
            block,
        }
    }

    /// End-of-data marker.
    pub fn end() -> Self {
        DataPacket::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedTableName {
    pub database: String,
    pub table: String,
}

impl QualifiedTableName {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        QualifiedTableName {
            database: database.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for QualifiedTableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TablesStatusRequest {
    pub tables: Vec<QualifiedTableName>,
}

impl TablesStatusRequest {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_varint(self.tables.len() as u64);
        for t in &self.tables {
            buf.put_string(&t.database);
            buf.put_string(&t.table);
        }
    }

    fn decode(r: &mut WireReader<'_>) -> DecodeResult<Self> {
        let count = r.read_varint_usize()?;
        let mut tables = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let database = r.read_string()?;
            let table = r.read_string()?;
            tables.push(QualifiedTableName { database, table });
        }
        Ok(TablesStatusRequest { tables })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableStatus {
    pub is_replicated: bool,
    pub absolute_delay: u32,
    pub is_readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TablesStatusResponse {
    pub statuses: Vec<(QualifiedTableName, TableStatus)>,
}

impl TablesStatusResponse {
    fn encode(&self, buf: &mut impl BufMut, rev: u64) {
        buf.put_varint(self.statuses.len() as u64);
        for (name, status) in &self.statuses {
            buf.put_string(&name.database);
            buf.put_string(&name.table);
            buf.put_bool(status.is_replicated);
            if status.is_replicated {
                buf.put_varint(status.absolute_delay as u64);
                if rev >= revision::TABLE_READ_ONLY_CHECK {
                    buf.put_bool(status.is_readonly);
                }
            }
        }
    }

    fn decode(r: &mut WireReader<'_>, rev: u64) -> DecodeResult<Self> {
        let count = r.read_varint_usize()?;
        let mut statuses = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let name = QualifiedTableName {
                database: r.read_string()?,
                table: r.read_string()?,
            };
            let mut status = TableStatus {
                is_replicated: r.read_bool()?,
                ..Default::default()
            };
            if status.is_replicated {
                status.absolute_delay = r.read_varint()? as u32;
                if rev >= revision::TABLE_READ_ONLY_CHECK {
                    status.is_readonly = r.read_bool()?;
                }
            }
            statuses.push((name, status));
        }
        Ok(TablesStatusResponse { statuses })
    }
}

/// Packets sent by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientPacket {
    Hello(ClientHello),
    Query(Box<QueryPacket>),
    Data(DataPacket),
    Scalar(DataPacket),
    Cancel,
    Ping,
    TablesStatusRequest(TablesStatusRequest),
    KeepAlive,
    IgnoredPartUuids(Vec<Uuid>),
    ReadTaskResponse(String),
    MergeTreeReadTaskResponse(ParallelReadResponse),
    SshChallengeRequest,
    SshChallengeResponse(String),
}

impl ClientPacket {
    pub fn id(&self) -> ClientPacketId {
        match self {
            Self::Hello(_) => ClientPacketId::Hello,
            Self::Query(_) => ClientPacketId::Query,
            Self::Data(_) => ClientPacketId::Data,
            Self::Scalar(_) => ClientPacketId::Scalar,
            Self::Cancel => ClientPacketId::Cancel,
            Self::Ping => ClientPacketId::Ping,
            Self::TablesStatusRequest(_) => ClientPacketId::TablesStatusRequest,
            Self::KeepAlive => ClientPacketId::KeepAlive,
            Self::IgnoredPartUuids(_) => ClientPacketId::IgnoredPartUuids,
            Self::ReadTaskResponse(_) => ClientPacketId::ReadTaskResponse,
            Self::MergeTreeReadTaskResponse(_) => ClientPacketId::MergeTreeReadTaskResponse,
            Self::SshChallengeRequest => ClientPacketId::SshChallengeRequest,
            Self::SshChallengeResponse(_) => ClientPacketId::SshChallengeResponse,
        }
    }

    pub fn name(&self) -> &'static str {
        self.id().as_str()
    }

    pub fn encode(&self, buf: &mut impl BufMut, rev: u64, compression: Option<CompressionMethod>) {
        if let Self::Hello(hello) = self {
            hello.encode(buf);
            return;
        }

        buf.put_varint(self.id() as u64);
        match self {
            Self::Hello(_) => (),
            Self::Query(query) => query.encode(buf, rev),
            Self::Data(data) | Self::Scalar(data) => {
                write_block(buf, &data.table_name, &data.block, rev, compression)
            }
            Self::Cancel | Self::Ping | Self::KeepAlive | Self::SshChallengeRequest => (),
            Self::TablesStatusRequest(req) => req.encode(buf),
            Self::IgnoredPartUuids(uuids) => buf.put_uuids(uuids),
            Self::ReadTaskResponse(resp) => {
                buf.put_varint(CLUSTER_PROCESSING_PROTOCOL_VERSION);
                buf.put_string(resp);
            }
            Self::MergeTreeReadTaskResponse(resp) => resp.encode(buf),
            Self::SshChallengeResponse(sig) => buf.put_string(sig),
        }
    }

    /// Decode a full client packet including its id.
    ///
    /// `data_compression` is the compression for Data and Scalar packets.
    pub fn decode(
        r: &mut WireReader<'_>,
        rev: u64,
        data_compression: Compression,
    ) -> DecodeResult<Self> {
        let raw_id = r.read_varint()?;
        let id = ClientPacketId::try_from(raw_id)
            .map_err(|id| DecodeError::Invalid(NativeSrvError::UnknownPacket(id)))?;

        Ok(match id {
            ClientPacketId::Hello => Self::Hello(ClientHello::decode(r)?),
            ClientPacketId::Query => Self::Query(Box::new(QueryPacket::decode(r, rev)?)),
            ClientPacketId::Data => Self::Data(read_data_packet(r, rev, data_compression)?),
            ClientPacketId::Scalar => Self::Scalar(read_data_packet(r, rev, data_compression)?),
            ClientPacketId::Cancel => Self::Cancel,
            ClientPacketId::Ping => Self::Ping,
            ClientPacketId::TablesStatusRequest => {
                Self::TablesStatusRequest(TablesStatusRequest::decode(r)?)
            }
            ClientPacketId::KeepAlive => Self::KeepAlive,
            ClientPacketId::IgnoredPartUuids => Self::IgnoredPartUuids(r.read_uuids()?),
            ClientPacketId::ReadTaskResponse => {
                let version = r.read_varint()?;
                if version != CLUSTER_PROCESSING_PROTOCOL_VERSION {
                    return Err(NativeSrvError::IncompatibleProtocol(format!(
                        "read task protocol version {version} is not supported"
                    ))
                    .into());
                }
                Self::ReadTaskResponse(r.read_string()?)
            }
            ClientPacketId::MergeTreeReadTaskResponse => {
                Self::MergeTreeReadTaskResponse(ParallelReadResponse::decode(r)?)
            }
            ClientPacketId::SshChallengeRequest => Self::SshChallengeRequest,
            ClientPacketId::SshChallengeResponse => Self::SshChallengeResponse(r.read_string()?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerHello {
    pub name: String,
    pub version_major: u64,
    pub version_minor: u64,
    /// The server's own revision, not the negotiated one.
    pub revision: u64,
    pub parallel_replicas_protocol_version: u64,
    pub timezone: String,
    pub display_name: String,
    pub version_patch: u64,
    pub proto_send_chunked: ChunkedMode,
    pub proto_recv_chunked: ChunkedMode,
    pub password_complexity_rules: Vec<(String, String)>,
    pub nonce: Option<u64>,
}

impl ServerHello {
    /// Encode with fields gated on the negotiated revision `rev`.
    fn encode(&self, buf: &mut impl BufMut, rev: u64) {
        buf.put_string(&self.name);
        buf.put_varint(self.version_major);
        buf.put_varint(self.version_minor);
        buf.put_varint(self.revision);
        if rev >= revision::VERSIONED_PARALLEL_REPLICAS {
            buf.put_varint(self.parallel_replicas_protocol_version);
        }
        if rev >= revision::SERVER_TIMEZONE {
            buf.put_string(&self.timezone);
        }
        if rev >= revision::SERVER_DISPLAY_NAME {
            buf.put_string(&self.display_name);
        }
        if rev >= revision::VERSION_PATCH {
            buf.put_varint(self.version_patch);
        }
        if rev >= revision::CHUNKED_PACKETS {
            buf.put_string(self.proto_send_chunked.as_str());
            buf.put_string(self.proto_recv_chunked.as_str());
        }
        if rev >= revision::PASSWORD_COMPLEXITY_RULES {
            buf.put_varint(self.password_complexity_rules.len() as u64);
            for (pattern, message) in &self.password_complexity_rules {
                buf.put_string(pattern);
                buf.put_string(message);
            }
        }
        if rev >= revision::INTERSERVER_SECRET_V2 {
            buf.put_u64_le(self.nonce.unwrap_or_default());
        }
    }

    /// Decode as a client that speaks `client_revision`.
    fn decode(r: &mut WireReader<'_>, client_revision: u64) -> DecodeResult<Self> {
        let name = r.read_string()?;
        let version_major = r.read_varint()?;
        let version_minor = r.read_varint()?;
        let server_revision = r.read_varint()?;
        let rev = server_revision.min(client_revision);

        let mut hello = ServerHello {
            name,
            version_major,
            version_minor,
            revision: server_revision,
            parallel_replicas_protocol_version: 0,
            timezone: String::new(),
            display_name: String::new(),
            version_patch: 0,
            proto_send_chunked: ChunkedMode::NotChunked,
            proto_recv_chunked: ChunkedMode::NotChunked,
            password_complexity_rules: Vec::new(),
            nonce: None,
        };
        if rev >= revision::VERSIONED_PARALLEL_REPLICAS {
            hello.parallel_replicas_protocol_version = r.read_varint()?;
        }
        if rev >= revision::SERVER_TIMEZONE {
            hello.timezone = r.read_string()?;
        }
        if rev >= revision::SERVER_DISPLAY_NAME {
            hello.display_name = r.read_string()?;
        }
        if rev >= revision::VERSION_PATCH {
            hello.version_patch = r.read_varint()?;
        }
        if rev >= revision::CHUNKED_PACKETS {
            hello.proto_send_chunked = r.read_string()?.parse()?;
            hello.proto_recv_chunked = r.read_string()?.parse()?;
        }
        if rev >= revision::PASSWORD_COMPLEXITY_RULES {
            let count = r.read_varint_usize()?;
            for _ in 0..count {
                let pattern = r.read_string()?;
                let message = r.read_string()?;
                hello.password_complexity_rules.push((pattern, message));
            }
        }
        if rev >= revision::INTERSERVER_SECRET_V2 {
            hello.nonce = Some(r.read_u64_le()?);
        }
        Ok(hello)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionPacket {
    pub code: i32,
    pub name: String,
    pub message: String,
    pub stack_trace: String,
    pub nested: Option<Box<ExceptionPacket>>,
}

impl ExceptionPacket {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        ExceptionPacket {
            code,
            name: crate::errors::codes::name(code).to_string(),
            message: message.into(),
            stack_trace: String::new(),
            nested: None,
        }
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.code);
        buf.put_string(&self.name);
        buf.put_string(&self.message);
        buf.put_string(&self.stack_trace);
        match &self.nested {
            Some(nested) => {
                buf.put_bool(true);
                nested.encode(buf);
            }
            None => buf.put_bool(false),
        }
    }

    fn decode(r: &mut WireReader<'_>) -> DecodeResult<Self> {
        let code = r.read_i32_le()?;
        let name = r.read_string()?;
        let message = r.read_string()?;
        let stack_trace = r.read_string()?;
        let nested = if r.read_bool()? {
            Some(Box::new(Self::decode(r)?))
        } else {
            None
        };
        Ok(ExceptionPacket {
            code,
            name,
            message,
            stack_trace,
            nested,
        })
    }
}

impl fmt::Display for ExceptionPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code: {}. {}: {}", self.code, self.name, self.message)
    }
}

/// Progress since the previous progress packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub read_rows: u64,
    pub read_bytes: u64,
    pub total_rows_to_read: u64,
    pub total_bytes_to_read: u64,
    pub written_rows: u64,
    pub written_bytes: u64,
    pub elapsed_ns: u64,
}

impl Progress {
    pub fn is_empty(&self) -> bool {
        self.read_rows == 0
            && self.read_bytes == 0
            && self.total_rows_to_read == 0
            && self.total_bytes_to_read == 0
            && self.written_rows == 0
            && self.written_bytes == 0
    }

    pub fn merge(&mut self, other: &Progress) {
        self.read_rows += other.read_rows;
        self.read_bytes += other.read_bytes;
        self.total_rows_to_read += other.total_rows_to_read;
        self.total_bytes_to_read += other.total_bytes_to_read;
        self.written_rows += other.written_rows;
        self.written_bytes += other.written_bytes;
        self.elapsed_ns = self.elapsed_ns.max(other.elapsed_ns);
    }

    fn encode(&self, buf: &mut impl BufMut, rev: u64) {
        buf.put_varint(self.read_rows);
        buf.put_varint(self.read_bytes);
        buf.put_varint(self.total_rows_to_read);
        if rev >= revision::TOTAL_BYTES_IN_PROGRESS {
            buf.put_varint(self.total_bytes_to_read);
        }
        if rev >= revision::CLIENT_WRITE_INFO {
            buf.put_varint(self.written_rows);
            buf.put_varint(self.written_bytes);
        }
        if rev >= revision::SERVER_QUERY_TIME_IN_PROGRESS {
            buf.put_varint(self.elapsed_ns);
        }
    }

    fn decode(r: &mut WireReader<'_>, rev: u64) -> DecodeResult<Self> {
        let mut p = Progress {
            read_rows: r.read_varint()?,
            read_bytes: r.read_varint()?,
            total_rows_to_read: r.read_varint()?,
            ..Default::default()
        };
        if rev >= revision::TOTAL_BYTES_IN_PROGRESS {
            p.total_bytes_to_read = r.read_varint()?;
        }
        if rev >= revision::CLIENT_WRITE_INFO {
            p.written_rows = r.read_varint()?;
            p.written_bytes = r.read_varint()?;
        }
        if rev >= revision::SERVER_QUERY_TIME_IN_PROGRESS {
            p.elapsed_ns = r.read_varint()?;
        }
        Ok(p)
    }
}

/// Summary of a finished query's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProfileInfo {
    pub rows: u64,
    pub blocks: u64,
    pub bytes: u64,
    pub applied_limit: bool,
    pub rows_before_limit: u64,
    pub calculated_rows_before_limit: bool,
    pub applied_aggregation: bool,
    pub rows_before_aggregation: u64,
}

impl ProfileInfo {
    fn encode(&self, buf: &mut impl BufMut, rev: u64) {
        buf.put_varint(self.rows);
        buf.put_varint(self.blocks);
        buf.put_varint(self.bytes);
        buf.put_bool(self.applied_limit);
        buf.put_varint(self.rows_before_limit);
        buf.put_bool(self.calculated_rows_before_limit);
        if rev >= revision::ROWS_BEFORE_AGGREGATION {
            buf.put_bool(self.applied_aggregation);
            buf.put_varint(self.rows_before_aggregation);
        }
    }

    fn decode(r: &mut WireReader<'_>, rev: u64) -> DecodeResult<Self> {
        let mut info = ProfileInfo {
            rows: r.read_varint()?,
            blocks: r.read_varint()?,
            bytes: r.read_varint()?,
            applied_limit: r.read_bool()?,
            rows_before_limit: r.read_varint()?,
            calculated_rows_before_limit: r.read_bool()?,
            ..Default::default()
        };
        if rev >= revision::ROWS_BEFORE_AGGREGATION {
            info.applied_aggregation = r.read_bool()?;
            info.rows_before_aggregation = r.read_varint()?;
        }
        Ok(info)
    }
}

/// Packets sent by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerPacket {
    Hello(ServerHello),
    Data(Block),
    Exception(ExceptionPacket),
    Progress(Progress),
    Pong,
    EndOfStream,
    ProfileInfo(ProfileInfo),
    Totals(Block),
    Extremes(Block),
    TablesStatusResponse(TablesStatusResponse),
    Log(Block),
    TableColumns { table_name: String, description: String },
    PartUuids(Vec<Uuid>),
    ReadTaskRequest,
    ProfileEvents(Block),
    MergeTreeAllRangesAnnouncement(InitialAllRangesAnnouncement),
    MergeTreeReadTaskRequest(ParallelReadRequest),
    TimezoneUpdate(String),
    SshChallenge(String),
}

impl ServerPacket {
    pub fn id(&self) -> ServerPacketId {
        match self {
            Self::Hello(_) => ServerPacketId::Hello,
            Self::Data(_) => ServerPacketId::Data,
            Self::Exception(_) => ServerPacketId::Exception,
            Self::Progress(_) => ServerPacketId::Progress,
            Self::Pong => ServerPacketId::Pong,
            Self::EndOfStream => ServerPacketId::EndOfStream,
            Self::ProfileInfo(_) => ServerPacketId::ProfileInfo,
            Self::Totals(_) => ServerPacketId::Totals,
            Self::Extremes(_) => ServerPacketId::Extremes,
            Self::TablesStatusResponse(_) => ServerPacketId::TablesStatusResponse,
            Self::Log(_) => ServerPacketId::Log,
            Self::TableColumns { .. } => ServerPacketId::TableColumns,
            Self::PartUuids(_) => ServerPacketId::PartUuids,
            Self::ReadTaskRequest => ServerPacketId::ReadTaskRequest,
            Self::ProfileEvents(_) => ServerPacketId::ProfileEvents,
            Self::MergeTreeAllRangesAnnouncement(_) => ServerPacketId::MergeTreeAllRangesAnnouncement,
            Self::MergeTreeReadTaskRequest(_) => ServerPacketId::MergeTreeReadTaskRequest,
            Self::TimezoneUpdate(_) => ServerPacketId::TimezoneUpdate,
            Self::SshChallenge(_) => ServerPacketId::SshChallenge,
        }
    }

    pub fn name(&self) -> &'static str {
        self.id().as_str()
    }

    /// Encode the packet. `compression` applies to Data, Totals and Extremes.
    /// Log and ProfileEvents blocks are never compressed.
    pub fn encode(&self, buf: &mut impl BufMut, rev: u64, compression: Option<CompressionMethod>) {
        buf.put_varint(self.id() as u64);
        match self {
            Self::Hello(hello) => hello.encode(buf, rev),
            Self::Data(block) | Self::Totals(block) | Self::Extremes(block) => {
                write_block(buf, "", block, rev, compression)
            }
            Self::Log(block) | Self::ProfileEvents(block) => write_block(buf, "", block, rev, None),
            Self::Exception(e) => e.encode(buf),
            Self::Progress(p) => p.encode(buf, rev),
            Self::Pong | Self::EndOfStream | Self::ReadTaskRequest => (),
            Self::ProfileInfo(info) => info.encode(buf, rev),
            Self::TablesStatusResponse(resp) => resp.encode(buf, rev),
            Self::TableColumns {
                table_name,
                description,
            } => {
                buf.put_string(table_name);
                buf.put_string(description);
            }
            Self::PartUuids(uuids) => buf.put_uuids(uuids),
            Self::MergeTreeAllRangesAnnouncement(ann) => ann.encode(buf),
            Self::MergeTreeReadTaskRequest(req) => req.encode(buf),
            Self::TimezoneUpdate(tz) => buf.put_string(tz),
            Self::SshChallenge(challenge) => buf.put_string(challenge),
        }
    }

    /// Decode a server packet as a client speaking `rev`. The server hello is
    /// decoded relative to the client's own revision.
    pub fn decode(r: &mut WireReader<'_>, rev: u64, compression: Compression) -> DecodeResult<Self> {
        let raw_id = r.read_varint()?;
        let id = ServerPacketId::try_from(raw_id).map_err(|id| {
            DecodeError::Invalid(NativeSrvError::malformed(format!("unknown server packet {id}")))
        })?;

        Ok(match id {
            ServerPacketId::Hello => Self::Hello(ServerHello::decode(r, rev)?),
            ServerPacketId::Data => Self::Data(read_data_packet(r, rev, compression)?.block),
            ServerPacketId::Totals => Self::Totals(read_data_packet(r, rev, compression)?.block),
            ServerPacketId::Extremes => {
                Self::Extremes(read_data_packet(r, rev, compression)?.block)
            }
            ServerPacketId::Log => {
                Self::Log(read_data_packet(r, rev, Compression::Disabled)?.block)
            }
            ServerPacketId::ProfileEvents => {
                Self::ProfileEvents(read_data_packet(r, rev, Compression::Disabled)?.block)
            }
            ServerPacketId::Exception => Self::Exception(ExceptionPacket::decode(r)?),
            ServerPacketId::Progress => Self::Progress(Progress::decode(r, rev)?),
            ServerPacketId::Pong => Self::Pong,
            ServerPacketId::EndOfStream => Self::EndOfStream,
            ServerPacketId::ProfileInfo => Self::ProfileInfo(ProfileInfo::decode(r, rev)?),
            ServerPacketId::TablesStatusResponse => {
                Self::TablesStatusResponse(TablesStatusResponse::decode(r, rev)?)
            }
            ServerPacketId::TableColumns => Self::TableColumns {
                table_name: r.read_string()?,
                description: r.read_string()?,
            },
            ServerPacketId::PartUuids => Self::PartUuids(r.read_uuids()?),
            ServerPacketId::ReadTaskRequest => Self::ReadTaskRequest,
            ServerPacketId::MergeTreeAllRangesAnnouncement => {
                Self::MergeTreeAllRangesAnnouncement(InitialAllRangesAnnouncement::decode(r)?)
            }
            ServerPacketId::MergeTreeReadTaskRequest => {
                Self::MergeTreeReadTaskRequest(ParallelReadRequest::decode(r)?)
            }
            ServerPacketId::TimezoneUpdate => Self::TimezoneUpdate(r.read_string()?),
            ServerPacketId::SshChallenge => Self::SshChallenge(r.read_string()?),
        })
    }
}

/// Write a table name followed by a block, compressing the block as a single
/// frame if requested.
fn write_block(
    buf: &mut impl BufMut,
    table_name: &str,
    block: &Block,
    rev: u64,
    compression: Option<CompressionMethod>,
) {
    buf.put_string(table_name);
    match compression {
        Some(method) => {
            let mut raw = Vec::with_capacity(block.byte_size() + 64);
            block.encode_native(&mut raw, rev);
            compression::write_frame(method, &raw, buf);
        }
        None => block.encode_native(buf, rev),
    }
}

fn read_data_packet(
    r: &mut WireReader<'_>,
    rev: u64,
    compression: Compression,
) -> DecodeResult<DataPacket> {
    let table_name = r.read_string()?;
    let block = match compression {
        Compression::Enabled => {
            let raw = compression::read_frame(r)?;
            let mut inner = WireReader::new(&raw);
            let block = crate::codec::wire::complete(Block::decode_native(&mut inner, rev))?;
            if !inner.is_empty() {
                return Err(NativeSrvError::malformed(format!(
                    "{} trailing bytes after compressed block",
                    inner.remaining()
                ))
                .into());
            }
            block
        }
        Compression::Disabled => Block::decode_native(r, rev)?,
    };
    Ok(DataPacket { table_name, block })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Column;

    fn roundtrip_client(packet: ClientPacket, rev: u64, compression: Compression) -> ClientPacket {
        let method = match compression {
            Compression::Enabled => Some(CompressionMethod::Lz4),
            Compression::Disabled => None,
        };
        let mut buf = Vec::new();
        packet.encode(&mut buf, rev, method);
        let mut r = WireReader::new(&buf);
        let decoded = ClientPacket::decode(&mut r, rev, compression).unwrap();
        assert!(r.is_empty(), "{} trailing bytes", r.remaining());
        decoded
    }

    #[test]
    fn query_packet_with_client_info() {
        let query = QueryPacket {
            query_id: "q1".to_string(),
            client_info: ClientInfo {
                query_kind: QueryKind::InitialQuery,
                initial_user: "default".to_string(),
                initial_query_id: "q1".to_string(),
                client_name: "test".to_string(),
                client_revision: revision::SERVER,
                trace_context: Some(TraceContext {
                    trace_id: (7u128 << 64) | 9,
                    span_id: 3,
                    tracestate: "x".to_string(),
                    trace_flags: 1,
                }),
                collaborate_with_initiator: true,
                count_participating_replicas: 2,
                number_of_current_replica: 1,
                ..Default::default()
            },
            settings: vec![SettingChange::new("extremes", "1").important()],
            interserver_hash: Vec::new(),
            stage: QueryProcessingStage::Complete,
            compression: Compression::Enabled,
            query: "SELECT 1".to_string(),
            parameters: vec![SettingChange::new("p", "'v'")],
        };

        for rev in [revision::MIN_SUPPORTED, revision::SERVER] {
            let packet = ClientPacket::Query(Box::new(query.clone()));
            let ClientPacket::Query(decoded) = roundtrip_client(packet, rev, Compression::Disabled)
            else {
                panic!("expected query");
            };
            assert_eq!("SELECT 1", decoded.query);
            assert_eq!(query.settings, decoded.settings);
            if rev == revision::SERVER {
                assert_eq!(query, *decoded);
            } else {
                // Fields added after the minimum revision are not sent.
                assert_eq!(None, decoded.client_info.trace_context);
                assert!(!decoded.client_info.collaborate_with_initiator);
                assert!(decoded.parameters.is_empty());
            }
        }
    }

    #[test]
    fn compressed_data_packet() {
        let block = Block::new(vec![Column::new("x", (0..1000u64).collect::<Vec<_>>())]);
        let packet = ClientPacket::Data(DataPacket::new(block.clone()));
        match roundtrip_client(packet, revision::SERVER, Compression::Enabled) {
            ClientPacket::Data(data) => assert_eq!(block, data.block),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn compressed_data_read_as_uncompressed_fails() {
        let block = Block::new(vec![Column::new("x", vec![1u64, 2])]);
        let mut buf = Vec::new();
        ClientPacket::Data(DataPacket::new(block)).encode(
            &mut buf,
            revision::SERVER,
            Some(CompressionMethod::Lz4),
        );
        let mut r = WireReader::new(&buf);
        assert!(ClientPacket::decode(&mut r, revision::SERVER, Compression::Disabled).is_err());
    }

    #[test]
    fn unknown_client_packet() {
        let mut buf = Vec::new();
        buf.put_varint(42);
        let mut r = WireReader::new(&buf);
        match ClientPacket::decode(&mut r, revision::SERVER, Compression::Disabled) {
            Err(DecodeError::Invalid(NativeSrvError::UnknownPacket(42))) => (),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn server_hello_fields_are_gated() {
        let hello = ServerHello {
            name: "NativeSrv".to_string(),
            version_major: 25,
            version_minor: 6,
            revision: revision::SERVER,
            parallel_replicas_protocol_version: 4,
            timezone: "UTC".to_string(),
            display_name: "srv".to_string(),
            version_patch: 3,
            proto_send_chunked: ChunkedMode::ChunkedOptional,
            proto_recv_chunked: ChunkedMode::NotChunkedOptional,
            password_complexity_rules: Vec::new(),
            nonce: Some(99),
        };

        let encode = |rev: u64| {
            let mut buf = Vec::new();
            ServerPacket::Hello(hello.clone()).encode(&mut buf, rev, None);
            buf
        };

        let full = encode(revision::SERVER);
        let old = encode(revision::MIN_SUPPORTED);
        assert!(old.len() < full.len());

        // An old client decodes only the fields it knows about.
        let mut r = WireReader::new(&old);
        let ServerPacket::Hello(decoded) =
            ServerPacket::decode(&mut r, revision::MIN_SUPPORTED, Compression::Disabled).unwrap()
        else {
            panic!("expected hello")
        };
        assert!(r.is_empty());
        assert_eq!(revision::SERVER, decoded.revision);
        assert_eq!(None, decoded.nonce);
        assert_eq!("UTC", decoded.timezone);

        let mut r = WireReader::new(&full);
        let ServerPacket::Hello(decoded) =
            ServerPacket::decode(&mut r, revision::SERVER, Compression::Disabled).unwrap()
        else {
            panic!("expected hello")
        };
        assert_eq!(hello, decoded);
    }

    #[test]
    fn progress_fields_are_gated() {
        let progress = Progress {
            read_rows: 1,
            read_bytes: 2,
            total_rows_to_read: 3,
            total_bytes_to_read: 4,
            written_rows: 5,
            written_bytes: 6,
            elapsed_ns: 7,
        };
        let mut buf = Vec::new();
        ServerPacket::Progress(progress).encode(&mut buf, revision::CLIENT_WRITE_INFO, None);
        let decoded =
            ServerPacket::decode(&mut WireReader::new(&buf), revision::CLIENT_WRITE_INFO, Compression::Disabled)
                .unwrap();
        assert_eq!(
            ServerPacket::Progress(Progress {
                total_bytes_to_read: 0,
                elapsed_ns: 0,
                ..progress
            }),
            decoded
        );
    }

    #[test]
    fn nested_exception() {
        let mut outer = ExceptionPacket::new(252, "outer");
        outer.nested = Some(Box::new(ExceptionPacket::new(49, "inner")));
        let mut buf = Vec::new();
        ServerPacket::Exception(outer.clone()).encode(&mut buf, revision::SERVER, None);
        let decoded =
            ServerPacket::decode(&mut WireReader::new(&buf), revision::SERVER, Compression::Disabled)
                .unwrap();
        assert_eq!(ServerPacket::Exception(outer), decoded);
    }

    #[test]
    fn log_blocks_ignore_query_compression() {
        let block = Block::new(vec![Column::new("text", vec!["hi".to_string()])]);
        let mut buf = Vec::new();
        ServerPacket::Log(block.clone()).encode(&mut buf, revision::SERVER, Some(CompressionMethod::Lz4));
        let decoded =
            ServerPacket::decode(&mut WireReader::new(&buf), revision::SERVER, Compression::Enabled)
                .unwrap();
        assert_eq!(ServerPacket::Log(block), decoded);
    }
}
