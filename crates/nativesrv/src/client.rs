//! Client side of the native protocol.
//!
//! Used by an initiator talking to the replicas it distributes reads to,
//! and by tests driving a server end to end.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::auth;
use crate::block::Block;
use crate::codec::client::ClientCodec;
use crate::compression::CompressionMethod;
use crate::errors::{ExecError, NativeSrvError, Result};
use crate::messages::{
    Addendum, ClientHello, ClientPacket, ClusterNameAndSalt, DataPacket, ExceptionPacket,
    ProfileInfo, Progress, QueryPacket, ServerHello, ServerPacket, TablesStatusRequest,
    TablesStatusResponse,
};
use crate::protocol::{
    self, ChunkedMode, Compression, INTERSERVER_SECRET_USER, PARALLEL_REPLICAS_PROTOCOL_VERSION,
    QueryKind, SSH_KEY_AUTHENTICATION_MARKER, revision,
};

/// How the client authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAuth {
    Password(String),
    /// Sign the server's challenge with a key.
    SigningKey(Vec<u8>),
    /// Connect as a server of `cluster`. Queries run as `user`.
    Interserver { cluster: String, secret: String },
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub client_name: String,
    pub revision: u64,
    pub user: String,
    pub auth: ClientAuth,
    pub database: String,
    pub quota_key: String,
    pub send_chunked: ChunkedMode,
    pub recv_chunked: ChunkedMode,
    /// Compress query data with this method.
    pub compression: Option<CompressionMethod>,
    /// Raw bytes written ahead of the hello, like a PROXY header.
    pub preamble: Vec<u8>,
    /// Limit on waiting for any single packet.
    pub receive_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            client_name: "nativesrv-client".to_string(),
            revision: revision::SERVER,
            user: "default".to_string(),
            auth: ClientAuth::Password(String::new()),
            database: String::new(),
            quota_key: String::new(),
            send_chunked: ChunkedMode::NotChunkedOptional,
            recv_chunked: ChunkedMode::NotChunkedOptional,
            compression: None,
            preamble: Vec::new(),
            receive_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientOptions {
    pub fn with_user(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.auth = ClientAuth::Password(password.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_compression(mut self, method: CompressionMethod) -> Self {
        self.compression = Some(method);
        self
    }

    pub fn with_chunked(mut self, send: ChunkedMode, recv: ChunkedMode) -> Self {
        self.send_chunked = send;
        self.recv_chunked = recv;
        self
    }
}

/// Everything the server sent for one query.
#[derive(Debug, Default)]
pub struct QueryResult {
    /// Data blocks with rows, headers are kept in `header`.
    pub blocks: Vec<Block>,
    pub header: Option<Block>,
    pub totals: Option<Block>,
    pub extremes: Option<Block>,
    pub profile_info: Option<ProfileInfo>,
    /// Sum of all progress packets.
    pub progress: Progress,
    pub progress_packets: usize,
    pub logs: Vec<Block>,
    pub profile_events: Vec<Block>,
    pub table_columns: Option<(String, String)>,
    pub part_uuids: Vec<Uuid>,
    pub timezone: Option<String>,
}

/// What [`QueryResult::absorb`] did with a packet.
#[derive(Debug)]
pub enum Absorbed {
    Continue,
    EndOfStream,
    /// Not part of a result.
    Other(ServerPacket),
}

impl QueryResult {
    pub fn num_rows(&self) -> usize {
        self.blocks.iter().map(|b| b.num_rows()).sum()
    }

    /// Take in the next packet of a result. Exceptions become errors.
    pub fn absorb(&mut self, packet: ServerPacket) -> Result<Absorbed> {
        match packet {
            ServerPacket::Data(block) => {
                if block.num_rows() == 0 {
                    self.header.get_or_insert(block);
                } else {
                    self.blocks.push(block);
                }
            }
            ServerPacket::Totals(block) => self.totals = Some(block),
            ServerPacket::Extremes(block) => self.extremes = Some(block),
            ServerPacket::ProfileInfo(info) => self.profile_info = Some(info),
            ServerPacket::Progress(progress) => {
                self.progress.merge(&progress);
                self.progress_packets += 1;
            }
            ServerPacket::Log(block) => self.logs.push(block),
            ServerPacket::ProfileEvents(block) => self.profile_events.push(block),
            ServerPacket::TableColumns {
                table_name,
                description,
            } => self.table_columns = Some((table_name, description)),
            ServerPacket::PartUuids(uuids) => self.part_uuids.extend(uuids),
            ServerPacket::TimezoneUpdate(tz) => self.timezone = Some(tz),
            ServerPacket::Exception(e) => return Err(exception_error(e)),
            ServerPacket::EndOfStream => return Ok(Absorbed::EndOfStream),
            other => return Ok(Absorbed::Other(other)),
        }
        Ok(Absorbed::Continue)
    }
}

fn exception_error(e: ExceptionPacket) -> NativeSrvError {
    let mut err = ExecError::new(e.code, e.message);
    if !e.stack_trace.is_empty() {
        err = err.with_stack_trace(e.stack_trace);
    }
    NativeSrvError::Exec(err)
}

/// A connection to a native protocol server.
#[derive(Debug)]
pub struct NativeClient<C> {
    framed: Framed<C, ClientCodec>,
    options: ClientOptions,
    server: ServerHello,
    /// Negotiated revision.
    revision: u64,
    /// Salt sent for inter-server authentication.
    salt: String,
}

impl<C> NativeClient<C>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the handshake on `conn`.
    pub async fn connect(conn: C, options: ClientOptions) -> Result<Self> {
        let mut framed = Framed::new(conn, ClientCodec::new(options.revision));
        if !options.preamble.is_empty() {
            framed.get_mut().write_all(&options.preamble).await?;
        }

        let user = match &options.auth {
            ClientAuth::Password(_) => options.user.clone(),
            ClientAuth::SigningKey(_) => format!("{SSH_KEY_AUTHENTICATION_MARKER}{}", options.user),
            ClientAuth::Interserver { .. } => INTERSERVER_SECRET_USER.to_string(),
        };
        let password = match &options.auth {
            ClientAuth::Password(password) => password.clone(),
            _ => String::new(),
        };
        framed
            .send(ClientPacket::Hello(ClientHello {
                client_name: options.client_name.clone(),
                version_major: protocol::VERSION_MAJOR,
                version_minor: protocol::VERSION_MINOR,
                revision: options.revision,
                database: options.database.clone(),
                user,
                password,
            }))
            .await?;

        let mut client = NativeClient {
            framed,
            revision: options.revision,
            options,
            server: ServerHello::default(),
            salt: String::new(),
        };
        match client.options.auth.clone() {
            ClientAuth::Password(_) => (),
            ClientAuth::SigningKey(key) => {
                client.framed.send(ClientPacket::SshChallengeRequest).await?;
                let ServerPacket::SshChallenge(challenge) = client.receive_handshake().await? else {
                    return Err(NativeSrvError::malformed("expected SSH challenge"));
                };
                let signature = auth::sign_challenge(&key, &challenge);
                client
                    .framed
                    .send(ClientPacket::SshChallengeResponse(signature))
                    .await?;
            }
            ClientAuth::Interserver { cluster, .. } => {
                client.salt = Uuid::new_v4().simple().to_string();
                client
                    .framed
                    .send(ClusterNameAndSalt {
                        cluster,
                        salt: client.salt.clone(),
                    })
                    .await?;
            }
        }

        let ServerPacket::Hello(server) = client.receive_handshake().await? else {
            return Err(NativeSrvError::malformed("expected server hello"));
        };
        let rev = server.revision.min(client.options.revision);
        client.revision = rev;
        client.framed.codec_mut().set_revision(rev);

        if rev >= revision::ADDENDUM {
            let addendum = Addendum {
                quota_key: client.options.quota_key.clone(),
                chunked: Some((client.options.send_chunked, client.options.recv_chunked)),
                parallel_replicas_protocol_version: Some(PARALLEL_REPLICAS_PROTOCOL_VERSION),
            };
            client.framed.send(addendum).await?;
        }
        if rev >= revision::CHUNKED_PACKETS {
            // Same resolution as the server's, from the other side.
            let send = ChunkedMode::negotiate(
                server.proto_recv_chunked,
                client.options.send_chunked,
                "send",
            )?;
            let recv = ChunkedMode::negotiate(
                server.proto_send_chunked,
                client.options.recv_chunked,
                "recv",
            )?;
            client.framed.codec_mut().set_chunked(send, recv);
        }
        debug!(server = %server.display_name, revision = rev, "connected");
        client.server = server;
        Ok(client)
    }

    pub fn server_hello(&self) -> &ServerHello {
        &self.server
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    async fn receive_handshake(&mut self) -> Result<ServerPacket> {
        match self.receive().await? {
            ServerPacket::Exception(e) => Err(exception_error(e)),
            packet => Ok(packet),
        }
    }

    pub async fn send(&mut self, packet: ClientPacket) -> Result<()> {
        trace!(packet = packet.name(), "client sending packet");
        self.framed.send(packet).await
    }

    /// Next packet from the server.
    pub async fn receive(&mut self) -> Result<ServerPacket> {
        let timeout = self.options.receive_timeout;
        match tokio::time::timeout(timeout, self.framed.next()).await {
            Ok(Some(packet)) => packet,
            Ok(None) => Err(NativeSrvError::ConnectionClosed),
            Err(_) => Err(NativeSrvError::Timeout {
                op: "waiting for server packet",
                timeout,
            }),
        }
    }

    /// Build a query packet the way this client sends them.
    pub fn query_packet(&self, query: &str) -> QueryPacket {
        let mut packet = QueryPacket::new(query);
        packet.query_id = Uuid::new_v4().to_string();
        packet.client_info.query_kind = QueryKind::InitialQuery;
        packet.client_info.initial_user = self.options.user.clone();
        packet.client_info.initial_query_id = packet.query_id.clone();
        packet.client_info.client_name = self.options.client_name.clone();
        packet.client_info.client_version_major = protocol::VERSION_MAJOR;
        packet.client_info.client_version_minor = protocol::VERSION_MINOR;
        packet.client_info.client_revision = self.options.revision;
        packet.client_info.quota_key = self.options.quota_key.clone();
        if self.options.compression.is_some() {
            packet.compression = Compression::Enabled;
        }
        packet
    }

    /// Send a query packet, sealing it with the cluster secret if this is an
    /// inter-server connection.
    pub async fn send_query(&mut self, mut packet: QueryPacket) -> Result<()> {
        if let ClientAuth::Interserver { secret, .. } = &self.options.auth {
            packet.interserver_hash = auth::interserver_hash(
                secret,
                &self.salt,
                self.server.nonce,
                &packet.query,
                &packet.query_id,
                &packet.client_info.initial_user,
            );
        }
        let compression = match packet.compression {
            Compression::Enabled => self.options.compression.or(Some(CompressionMethod::Lz4)),
            Compression::Disabled => None,
        };
        self.framed.codec_mut().set_compression(compression);
        self.send(ClientPacket::Query(Box::new(packet))).await
    }

    /// Read packets up to the end of the current result.
    pub async fn receive_result(&mut self) -> Result<QueryResult> {
        let mut result = QueryResult::default();
        loop {
            let packet = self.receive().await?;
            match result.absorb(packet)? {
                Absorbed::Continue => (),
                Absorbed::EndOfStream => return Ok(result),
                Absorbed::Other(packet) => {
                    return Err(NativeSrvError::malformed(format!(
                        "unexpected {} packet in query result",
                        packet.name()
                    )));
                }
            }
        }
    }

    /// Run a query that doesn't read client data.
    pub async fn query(&mut self, query: &str) -> Result<QueryResult> {
        let packet = self.query_packet(query);
        self.send_query(packet).await?;
        self.receive_result().await
    }

    /// Run an insert, sending `blocks` once the server asked for data.
    pub async fn insert(&mut self, query: &str, blocks: Vec<Block>) -> Result<QueryResult> {
        let packet = self.query_packet(query);
        self.send_query(packet).await?;

        let mut result = QueryResult::default();
        while result.header.is_none() {
            let packet = self.receive().await?;
            match result.absorb(packet)? {
                Absorbed::Continue => (),
                Absorbed::EndOfStream => return Ok(result),
                Absorbed::Other(packet) => {
                    return Err(NativeSrvError::malformed(format!(
                        "unexpected {} packet before insert header",
                        packet.name()
                    )));
                }
            }
        }
        for block in blocks {
            self.send(ClientPacket::Data(DataPacket::new(block))).await?;
        }
        self.send(ClientPacket::Data(DataPacket::end())).await?;

        let rest = self.receive_result().await?;
        result.progress.merge(&rest.progress);
        result.progress_packets += rest.progress_packets;
        result.logs.extend(rest.logs);
        result.profile_events.extend(rest.profile_events);
        Ok(result)
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.send(ClientPacket::Ping).await?;
        loop {
            match self.receive().await? {
                ServerPacket::Pong => return Ok(()),
                // Leftovers of a previous query.
                ServerPacket::Progress(_) | ServerPacket::Log(_) | ServerPacket::ProfileEvents(_) => {}
                ServerPacket::Exception(e) => return Err(exception_error(e)),
                other => {
                    return Err(NativeSrvError::malformed(format!(
                        "expected Pong, got {}",
                        other.name()
                    )));
                }
            }
        }
    }

    pub async fn tables_status(
        &mut self,
        request: TablesStatusRequest,
    ) -> Result<TablesStatusResponse> {
        self.send(ClientPacket::TablesStatusRequest(request)).await?;
        match self.receive().await? {
            ServerPacket::TablesStatusResponse(response) => Ok(response),
            ServerPacket::Exception(e) => Err(exception_error(e)),
            other => Err(NativeSrvError::malformed(format!(
                "expected TablesStatusResponse, got {}",
                other.name()
            ))),
        }
    }

    pub async fn cancel(&mut self) -> Result<()> {
        self.send(ClientPacket::Cancel).await
    }

    /// Close the connection.
    pub async fn close(mut self) -> Result<()> {
        self.framed.get_mut().shutdown().await?;
        Ok(())
    }
}
