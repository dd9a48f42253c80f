use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::handshake::HandshakeCodec;
use crate::codec::server::ServerCodec;
use crate::config::ProtocolHandlerConfig;
use crate::engine::QueryEngine;
use crate::errors::{NativeSrvError, Result};
use crate::messages::{ClientPacket, ExceptionPacket, ServerPacket};
use crate::metrics::ConnectionMetrics;
use crate::protocol::revision;
use crate::query_state::{LastBlockInputParameters, PacketDisposition, QueryState};
use crate::reader::{BoxedRead, PacketReader};
use crate::session::{Handshake, Session, WRONG_PORT_RESPONSE};
use crate::timeouts::ConnectionTimeouts;
use crate::writer::SharedWriter;

/// Serves the native protocol on connections, running queries through a
/// [`QueryEngine`].
#[derive(Debug, Clone)]
pub struct ProtocolHandler {
    engine: Arc<dyn QueryEngine>,
    config: Arc<ProtocolHandlerConfig>,
    metrics: Arc<ConnectionMetrics>,
}

impl ProtocolHandler {
    pub fn new(engine: Arc<dyn QueryEngine>, config: ProtocolHandlerConfig) -> Self {
        ProtocolHandler {
            engine,
            config: Arc::new(config),
            metrics: Arc::new(ConnectionMetrics::default()),
        }
    }

    /// Count into `metrics` instead of counters private to this handler.
    pub fn with_metrics(mut self, metrics: Arc<ConnectionMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<ConnectionMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &ProtocolHandlerConfig {
        &self.config
    }

    /// Run the protocol on a connection until the client leaves, a fatal
    /// error occurs, or `shutdown` fires while the connection is idle.
    pub async fn handle_connection<C>(
        &self,
        conn: C,
        peer: Option<SocketAddr>,
        shutdown: CancellationToken,
    ) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
    {
        let _guard = self.metrics.connection_opened();
        let (read, write) = tokio::io::split(conn);

        let defaults = &self.config.default_settings;
        let timeouts = Arc::new(ConnectionTimeouts::new(
            defaults.send_timeout,
            defaults.receive_timeout,
        ));
        let writer = SharedWriter::new(write, ServerCodec::new(revision::SERVER), timeouts.clone());
        let mut framed = FramedRead::new(
            Box::new(read) as BoxedRead,
            HandshakeCodec::new(self.config.parse_proxy_protocol),
        );

        let handshake = Handshake::new(&self.config, self.engine.as_ref(), &writer, &mut framed);
        let session = match handshake.run(peer).await {
            Ok(session) => session,
            Err(NativeSrvError::WrongPort) => {
                debug!(?peer, "client sent HTTP to the native port");
                writer.write_raw(WRONG_PORT_RESPONSE).await?;
                let _ = writer.shutdown().await;
                return Err(NativeSrvError::WrongPort);
            }
            Err(e) => {
                warn!(%e, ?peer, "handshake failed");
                if e.is_writable() {
                    let exception = ExceptionPacket::new(e.code(), e.client_message());
                    let _ = writer.send(ServerPacket::Exception(exception)).await;
                    self.metrics.exception_sent();
                }
                let _ = writer.shutdown().await;
                return Err(e);
            }
        };

        let cs = session.connection_settings;
        timeouts.set(cs.send_timeout, cs.receive_timeout);
        let (rev, send_chunked, recv_chunked) =
            (session.revision, session.send_chunked, session.recv_chunked);
        writer
            .configure(|codec| codec.set_chunked(send_chunked, recv_chunked))
            .await;
        // Anything the client already sent stays buffered across the switch.
        let framed =
            framed.map_decoder(|_| ServerCodec::new(rev).with_chunked(send_chunked, recv_chunked));

        let mut conn = Connection {
            engine: self.engine.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            session,
            reader: PacketReader::new(framed, timeouts.clone()),
            writer,
            timeouts,
            state: QueryState::default(),
            last_block_in: LastBlockInputParameters::default(),
            shutdown,
        };
        let res = conn.run().await;
        let _ = conn.writer.shutdown().await;
        res
    }
}

/// A connection past its handshake.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) engine: Arc<dyn QueryEngine>,
    pub(crate) config: Arc<ProtocolHandlerConfig>,
    pub(crate) metrics: Arc<ConnectionMetrics>,
    pub(crate) session: Session,
    pub(crate) reader: PacketReader,
    pub(crate) writer: SharedWriter,
    pub(crate) timeouts: Arc<ConnectionTimeouts>,
    pub(crate) state: QueryState,
    pub(crate) last_block_in: LastBlockInputParameters,
    shutdown: CancellationToken,
}

impl Connection {
    async fn run(&mut self) -> Result<()> {
        loop {
            let packet = match self.wait_for_packet().await {
                Ok(Some(packet)) => packet,
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.recover(e).await?;
                    continue;
                }
            };

            match self.dispatch(packet).await {
                Ok(()) => {
                    // Prelude packets are kept until their query arrives.
                    if !matches!(self.state, QueryState::AwaitingQuery(_)) {
                        self.reset_state();
                    }
                }
                Err(e) => self.recover(e).await?,
            }
        }
    }

    /// Wait for the client's next packet while no query runs. Returns `None`
    /// if the connection should close.
    async fn wait_for_packet(&mut self) -> Result<Option<ClientPacket>> {
        let cs = self.session.connection_settings;
        let poll_interval = cs.poll_interval.max(Duration::from_millis(1));
        let idle_since = Instant::now();
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("server shutting down, closing idle connection");
                    return Ok(None);
                }
                res = self.reader.next() => {
                    if res.as_ref().is_ok_and(|p| p.is_none()) {
                        debug!("client closed the connection");
                    }
                    return res;
                }
                _ = tokio::time::sleep(poll_interval) => {
                    if idle_since.elapsed() >= cs.idle_connection_timeout {
                        debug!(timeout = ?cs.idle_connection_timeout, "closing idle connection");
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, packet: ClientPacket) -> Result<()> {
        let disposition = self.state.classify(&packet);
        trace!(packet = packet.name(), ?disposition, "received packet");
        match (disposition, packet) {
            (PacketDisposition::StartQuery, ClientPacket::Query(query)) => {
                self.process_query(query).await
            }
            (PacketDisposition::Ping, _) => self.writer.send(ServerPacket::Pong).await,
            (PacketDisposition::Ignore, _) => Ok(()),
            (PacketDisposition::TablesStatus, ClientPacket::TablesStatusRequest(req)) => {
                self.process_tables_status_request(req).await
            }
            (PacketDisposition::IgnoredPartUuids, ClientPacket::IgnoredPartUuids(uuids)) => {
                if let QueryState::AwaitingQuery(prelude) = &mut self.state {
                    prelude.ignored_part_uuids = Some(uuids);
                }
                Ok(())
            }
            (PacketDisposition::Scalar, ClientPacket::Scalar(scalar)) => {
                if let QueryState::AwaitingQuery(prelude) = &mut self.state {
                    prelude.scalars.push((scalar.table_name, scalar.block));
                }
                Ok(())
            }
            // Stray data was already read in full with the previous query's
            // compression, so the stream is still in sync.
            (_, packet) => Err(NativeSrvError::UnexpectedPacket {
                packet: packet.name(),
                state: self.state.describe(),
            }),
        }
    }

    /// Report an error to the client and get ready for the next query.
    /// Errors the connection can't recover from are returned.
    async fn recover(&mut self, e: NativeSrvError) -> Result<()> {
        if e.is_fatal() {
            warn!(%e, code = e.code(), "closing connection after error");
        } else {
            debug!(%e, code = e.code(), "query failed");
        }

        // The client is still sending data for a failed insert.
        if !e.is_fatal() && self.state.has_unread_insert_data() {
            if let QueryState::ReceivingInsert(insert) = &mut self.state {
                insert.skipping_data = true;
            }
            if let Err(skip_err) = self.skip_data().await {
                self.reset_state();
                return Err(skip_err);
            }
        }

        if e.is_writable() {
            let mut packets = Vec::with_capacity(2);
            if let Some(logs) = self.state.active_query().and_then(|q| q.logs.as_ref()) {
                if let Some(block) = logs.queue().drain_block() {
                    packets.push(ServerPacket::Log(block));
                }
            }
            packets.push(ServerPacket::Exception(self.exception_packet(&e)));
            self.metrics.exception_sent();
            if let Err(send_err) = self.writer.send_all(packets).await {
                self.reset_state();
                return Err(send_err);
            }
        }

        self.reset_state();
        if e.is_fatal() { Err(e) } else { Ok(()) }
    }

    fn exception_packet(&self, e: &NativeSrvError) -> ExceptionPacket {
        let with_stack_trace = match self.state.active_query() {
            Some(query) => query.ctx.settings.calculate_text_stack_trace,
            None => self.session.connection_settings.calculate_text_stack_trace,
        };
        let mut packet = ExceptionPacket::new(e.code(), e.client_message());
        if with_stack_trace {
            if let Some(trace) = e.stack_trace() {
                packet.stack_trace = trace.to_string();
            }
        }
        packet
    }

    /// Discard the rest of a failed insert's data, up to the end of data
    /// marker.
    async fn skip_data(&mut self) -> Result<()> {
        loop {
            let packet = self.reader.next_timed().await?;
            match (self.state.classify(&packet), &packet) {
                (PacketDisposition::Discard, ClientPacket::Data(data)) => {
                    if data.block.is_empty() {
                        trace!("skipped remaining insert data");
                        return Ok(());
                    }
                }
                (PacketDisposition::Ping, _) => self.writer.send(ServerPacket::Pong).await?,
                // The client gave up on the insert.
                (PacketDisposition::Cancel, _) => return Ok(()),
                (PacketDisposition::Ignore | PacketDisposition::Scalar, _) => (),
                (_, packet) => {
                    debug!(packet = packet.name(), "unexpected packet while skipping insert data");
                    return Ok(());
                }
            }
        }
    }

    /// Drop the finished query, putting the connection back in its idle
    /// state.
    pub(crate) fn reset_state(&mut self) {
        self.state.reset();
        // Data sent after a failed query is decoded like the query's own.
        self.reader
            .codec_mut()
            .set_recv_compression(self.last_block_in.compression);
    }
}
