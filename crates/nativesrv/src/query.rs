//! Running queries on a connection.
//!
//! A query moves blocks in one of three ways: an ordinary query sends the
//! blocks its pipeline produces, an insert reads blocks from the client and
//! pushes them into its pipeline, and an async insert reads every block up
//! front and hands them to the engine's insert queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, trace};
use uuid::Uuid;

use crate::async_insert::{AsyncInsertKey, AsyncInsertQueue, PushResult};
use crate::auth;
use crate::block::Block;
use crate::cancel::{CancellationStatus, QueryCallbacks};
use crate::engine::{PullingPipeline, PushingPipeline, QueryContext, QueryPipeline};
use crate::errors::{ExecError, NativeSrvError, Result};
use crate::executor::PipelineExecutor;
use crate::handler::Connection;
use crate::logs::{self, LogsQueue, LogsRegistration};
use crate::messages::{
    ClientPacket, QueryPacket, ServerPacket, TablesStatusRequest, TablesStatusResponse,
};
use crate::parallel_read::channel::ReadTaskChannel;
use crate::profile_events::events;
use crate::protocol::{Compression, QueryKind, revision};
use crate::query_state::{
    ActiveQuery, ExecutingState, InsertState, LastBlockInputParameters, PacketDisposition,
    QueryState,
};
use crate::session::SessionAuth;
use crate::timeouts::TimeoutSetter;

/// Where the blocks of an insert go.
enum InsertSink<'a> {
    Pipeline(&'a mut Box<dyn PushingPipeline>),
    Buffer(&'a mut Vec<Block>),
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl Connection {
    pub(crate) async fn process_query(&mut self, packet: Box<QueryPacket>) -> Result<()> {
        let prelude = self.state.take_prelude();
        let QueryPacket {
            query_id,
            client_info,
            settings: changes,
            interserver_hash,
            stage,
            compression,
            query,
            parameters,
        } = *packet;
        let query_id = if query_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            query_id
        };

        let mut settings = self.session.settings.clone();
        let user = match &self.session.auth {
            SessionAuth::User(user) => user.name.clone(),
            SessionAuth::Interserver { salt, secret, .. } => {
                let expected = auth::interserver_hash(
                    secret,
                    salt,
                    self.session.nonce,
                    &query,
                    &query_id,
                    &client_info.initial_user,
                );
                if expected != interserver_hash {
                    return Err(NativeSrvError::AuthenticationFailed(
                        "interserver authentication failed, hash mismatch".to_string(),
                    ));
                }
                let user = self
                    .config
                    .authenticator
                    .user_for_interserver(&client_info.initial_user)
                    .await?;
                for (name, value) in &user.settings {
                    settings.set(name, value)?;
                }
                user.name
            }
        };
        settings.apply_changes(&changes)?;

        self.last_block_in = LastBlockInputParameters { compression };
        self.reader.codec_mut().set_recv_compression(compression);
        let send_compression = match compression {
            Compression::Enabled => Some(settings.network_compression_method),
            Compression::Disabled => None,
        };
        self.writer
            .configure(|codec| codec.set_send_compression(send_compression))
            .await;

        let logs = if self.session.revision >= revision::SERVER_LOGS {
            LogsQueue::new(&query_id, &self.config.host_name, settings.send_logs_level)
                .map(LogsRegistration::register)
        } else {
            None
        };
        let span = logs::query_span(&query_id, logs.as_ref());

        let callbacks = Arc::new(QueryCallbacks::default());
        let pulls_read_tasks = client_info.query_kind == QueryKind::SecondaryQuery
            || client_info.collaborate_with_initiator;
        let timeout_setter = TimeoutSetter::new(
            self.timeouts.clone(),
            settings.send_timeout,
            settings.receive_timeout,
        );
        let session_timezone = settings.session_timezone.clone();

        let mut ctx = QueryContext::new(query_id, query)
            .with_user(user)
            .with_database(self.session.database.clone())
            .with_settings(settings)
            .with_callbacks(callbacks.clone())
            .with_ignored_part_uuids(prelude.ignored_part_uuids.unwrap_or_default())
            .with_scalars(prelude.scalars);
        ctx.client_info = client_info;
        ctx.stage = stage;
        ctx.parameters = parameters.into_iter().map(|p| (p.name, p.value)).collect();
        if pulls_read_tasks {
            ctx = ctx.with_read_tasks(ReadTaskChannel::new(self.writer.clone(), callbacks));
        }
        let ctx = Arc::new(ctx);

        self.metrics.query_started();
        let mut active = ActiveQuery::new(ctx.clone(), compression, span.clone());
        active.logs = logs;
        active.timeout_setter = Some(timeout_setter);
        self.state = QueryState::Executing(Box::new(ExecutingState {
            query: active,
            input: None,
            sent_all_data: false,
        }));

        self.run_query(ctx, session_timezone).instrument(span).await
    }

    async fn run_query(&mut self, ctx: Arc<QueryContext>, session_timezone: String) -> Result<()> {
        debug!(query = %ctx.query, user = %ctx.user, database = %ctx.database, "executing query");

        if self.session.revision >= revision::TIMEZONE_UPDATES && !session_timezone.is_empty() {
            self.writer
                .send(ServerPacket::TimezoneUpdate(session_timezone))
                .await?;
        }

        ctx.profile_events().increment(events::QUERY, 1);
        let pipeline = self.engine.execute(ctx.clone()).await?;

        let part_uuids = ctx.take_part_uuids();
        if !part_uuids.is_empty() {
            self.writer.send(ServerPacket::PartUuids(part_uuids)).await?;
        }

        match pipeline {
            QueryPipeline::Pulling(pipeline) => {
                ctx.profile_events().increment(events::SELECT_QUERY, 1);
                self.process_ordinary_query(&ctx, pipeline).await?;
            }
            QueryPipeline::Pushing(pipeline) => {
                ctx.profile_events().increment(events::INSERT_QUERY, 1);
                self.start_insert_query()?;
                let queue = self
                    .engine
                    .async_insert_queue()
                    .filter(|_| ctx.settings.async_insert);
                match queue {
                    Some(queue) => {
                        self.process_async_insert_query(&ctx, pipeline, queue)
                            .await?
                    }
                    None => self.process_insert_query(&ctx, pipeline).await?,
                }
            }
            QueryPipeline::Completed => (),
        }

        self.finish_query().await
    }

    async fn process_ordinary_query(
        &mut self,
        ctx: &Arc<QueryContext>,
        pipeline: Box<dyn PullingPipeline>,
    ) -> Result<()> {
        let header = pipeline.header();
        let input = ctx.take_input_feed();

        let mut packets = Vec::with_capacity(2);
        if let Some(feed) = &input {
            // Asks the client for the data the query reads.
            packets.push(ServerPacket::Data(feed.header.clone()));
        }
        if header.num_columns() > 0 {
            packets.push(ServerPacket::Data(header));
        }
        self.writer.send_all(packets).await?;
        if let QueryState::Executing(exec) = &mut self.state {
            exec.input = input;
        }

        let callbacks = ctx.callbacks().clone();
        let mut executor = PipelineExecutor::spawn(pipeline, callbacks.clone());
        let mut ticker = ticker(ctx.settings.interactive_delay);
        loop {
            tokio::select! {
                block = executor.next() => match block {
                    Some(Ok(block)) => {
                        // Cancelled queries stop sending results.
                        if !callbacks.is_fully_cancelled() {
                            self.send_data(block).await?;
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                },
                packet = self.reader.next() => {
                    let Some(packet) = packet? else {
                        return Err(self.client_went_away(&callbacks));
                    };
                    self.handle_packet_while_executing(ctx, packet).await?;
                }
                _ = ticker.tick() => self.send_query_updates().await?,
            }
        }

        let mut pipeline = executor.finish().await?;
        if !callbacks.is_fully_cancelled() {
            let mut packets = Vec::new();
            if let Some(totals) = pipeline.totals() {
                packets.push(ServerPacket::Totals(totals));
            }
            if let Some(extremes) = pipeline.extremes() {
                packets.push(ServerPacket::Extremes(extremes));
            }
            if let Some(info) = pipeline.profile_info() {
                packets.push(ServerPacket::ProfileInfo(info));
            }
            self.writer.send_all(packets).await?;
        } else {
            debug!("query cancelled, skipping remaining results");
        }

        if let QueryState::Executing(exec) = &mut self.state {
            exec.input = None;
            exec.sent_all_data = true;
        }
        Ok(())
    }

    async fn handle_packet_while_executing(
        &mut self,
        ctx: &Arc<QueryContext>,
        packet: ClientPacket,
    ) -> Result<()> {
        let disposition = self.state.classify(&packet);
        trace!(packet = packet.name(), ?disposition, "received packet while executing");
        match (disposition, packet) {
            (PacketDisposition::Cancel, _) => {
                let status = ctx
                    .callbacks()
                    .decrease_cancellation_status(ctx.settings.partial_result_on_first_cancel);
                // Any cancel stops reading client input.
                if let QueryState::Executing(exec) = &mut self.state {
                    exec.input = None;
                }
                debug!(?status, "cancel received");
                Ok(())
            }
            (PacketDisposition::Ping, _) => self.writer.send(ServerPacket::Pong).await,
            (PacketDisposition::InputData, ClientPacket::Data(data)) => {
                let QueryState::Executing(exec) = &mut self.state else {
                    return Ok(());
                };
                let Some(feed) = &exec.input else {
                    return Ok(());
                };
                if data.block.is_empty() {
                    trace!("end of input data");
                    exec.input = None;
                    return Ok(());
                }
                data.block.check_matches_header(&feed.header)?;
                if feed.tx.send(data.block).is_err() {
                    // The pipeline stopped reading.
                    exec.input = None;
                }
                Ok(())
            }
            (PacketDisposition::ReadTaskResponse, ClientPacket::ReadTaskResponse(task)) => {
                if ctx.callbacks().deliver_task_response(task) {
                    Ok(())
                } else {
                    Err(NativeSrvError::UnexpectedPacket {
                        packet: "ReadTaskResponse",
                        state: "no read task was requested",
                    })
                }
            }
            (
                PacketDisposition::ReadTaskResponse,
                ClientPacket::MergeTreeReadTaskResponse(response),
            ) => {
                if ctx.callbacks().deliver_parallel_response(response) {
                    Ok(())
                } else {
                    Err(NativeSrvError::UnexpectedPacket {
                        packet: "MergeTreeReadTaskResponse",
                        state: "no ranges were requested",
                    })
                }
            }
            (PacketDisposition::Discard | PacketDisposition::Ignore, _) => Ok(()),
            (_, packet) => Err(NativeSrvError::UnexpectedPacket {
                packet: packet.name(),
                state: self.state.describe(),
            }),
        }
    }

    /// Move the running query into the insert state.
    fn start_insert_query(&mut self) -> Result<()> {
        let QueryState::Executing(exec) = std::mem::replace(&mut self.state, QueryState::Completed)
        else {
            return Err(ExecError::logical("insert started without a running query").into());
        };
        self.state = QueryState::ReceivingInsert(Box::new(InsertState {
            query: exec.query,
            header_sent: false,
            read_all_data: false,
            skipping_data: false,
        }));
        Ok(())
    }

    /// Tell the client what the insert expects. Returns the header blocks
    /// are checked against.
    async fn send_insert_header(&mut self, pipeline: &dyn PushingPipeline) -> Result<Block> {
        let header = pipeline.header();
        let mut packets = Vec::with_capacity(2);
        if self.session.revision >= revision::COLUMN_DEFAULTS_METADATA {
            if let Some(description) = pipeline.columns_description() {
                packets.push(ServerPacket::TableColumns {
                    table_name: pipeline.table_name(),
                    description,
                });
            }
        }
        packets.push(ServerPacket::Data(header.clone()));
        self.writer.send_all(packets).await?;

        if let QueryState::ReceivingInsert(insert) = &mut self.state {
            insert.header_sent = true;
        }
        Ok(header)
    }

    async fn process_insert_query(
        &mut self,
        ctx: &Arc<QueryContext>,
        mut pipeline: Box<dyn PushingPipeline>,
    ) -> Result<()> {
        let header = self.send_insert_header(pipeline.as_ref()).await?;
        let complete = self
            .read_insert_data(ctx, &header, InsertSink::Pipeline(&mut pipeline))
            .await?;
        if complete {
            pipeline.finish().await?;
        } else {
            debug!("insert cancelled, nothing committed");
        }
        Ok(())
    }

    async fn process_async_insert_query(
        &mut self,
        ctx: &Arc<QueryContext>,
        mut pipeline: Box<dyn PushingPipeline>,
        queue: Arc<dyn AsyncInsertQueue>,
    ) -> Result<()> {
        let header = self.send_insert_header(pipeline.as_ref()).await?;
        let mut blocks = Vec::new();
        let complete = self
            .read_insert_data(ctx, &header, InsertSink::Buffer(&mut blocks))
            .await?;
        if !complete {
            debug!("async insert cancelled, nothing queued");
            return Ok(());
        }

        let key = AsyncInsertKey::new(&ctx.query, &ctx.database, &ctx.user, ctx.settings.changes());
        ctx.profile_events().increment(events::ASYNC_INSERT_QUERY, 1);
        match queue.push(key, blocks, &ctx.settings).await? {
            PushResult::Inline(blocks) => {
                trace!(blocks = blocks.len(), "applying async insert inline");
                for block in blocks {
                    pipeline.push(block).await?;
                }
                pipeline.finish().await?;
            }
            PushResult::Deferred(ticket) => {
                if ctx.settings.wait_for_async_insert {
                    ticket
                        .wait(ctx.settings.wait_for_async_insert_timeout)
                        .await?;
                } else {
                    debug!("async insert queued");
                }
            }
        }
        Ok(())
    }

    /// Read the client's blocks up to the end of data marker. Returns false
    /// if the client cancelled the insert and nothing should be committed.
    async fn read_insert_data(
        &mut self,
        ctx: &Arc<QueryContext>,
        header: &Block,
        mut sink: InsertSink<'_>,
    ) -> Result<bool> {
        let mut ticker = ticker(ctx.settings.interactive_delay);
        let mut deadline = Instant::now() + self.timeouts.receive();
        loop {
            let packet = tokio::select! {
                packet = self.reader.next() => match packet? {
                    Some(packet) => packet,
                    None => return Err(self.client_went_away(ctx.callbacks())),
                },
                _ = ticker.tick() => {
                    self.send_query_updates().await?;
                    continue;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(NativeSrvError::Timeout {
                        op: "receiving data from client",
                        timeout: self.timeouts.receive(),
                    });
                }
            };
            deadline = Instant::now() + self.timeouts.receive();

            match (self.state.classify(&packet), packet) {
                (PacketDisposition::InsertData, ClientPacket::Data(data)) => {
                    if data.block.is_empty() {
                        if let QueryState::ReceivingInsert(insert) = &mut self.state {
                            insert.read_all_data = true;
                        }
                        return Ok(true);
                    }
                    data.block.check_matches_header(header)?;
                    let rows = data.block.num_rows() as u64;
                    let bytes = data.block.byte_size() as u64;
                    match &mut sink {
                        InsertSink::Pipeline(pipeline) => pipeline.push(data.block).await?,
                        InsertSink::Buffer(blocks) => blocks.push(data.block),
                    }
                    ctx.progress().add_written(rows, bytes);
                    ctx.profile_events()
                        .increment(events::INSERTED_ROWS, rows as i64);
                    ctx.profile_events()
                        .increment(events::INSERTED_BYTES, bytes as i64);
                }
                (PacketDisposition::Scalar, ClientPacket::Scalar(scalar)) => {
                    ctx.add_scalar(scalar.table_name, scalar.block);
                }
                (PacketDisposition::Cancel, _) => {
                    let status = ctx
                        .callbacks()
                        .decrease_cancellation_status(ctx.settings.partial_result_on_first_cancel);
                    // The client stops sending, there's nothing left to skip.
                    if let QueryState::ReceivingInsert(insert) = &mut self.state {
                        insert.read_all_data = true;
                    }
                    // A read cancel keeps the blocks pushed so far.
                    return Ok(status == CancellationStatus::ReadCancelled);
                }
                (PacketDisposition::Ping, _) => self.writer.send(ServerPacket::Pong).await?,
                (PacketDisposition::Ignore | PacketDisposition::Discard, _) => (),
                (_, packet) => {
                    return Err(NativeSrvError::UnexpectedPacket {
                        packet: packet.name(),
                        state: self.state.describe(),
                    });
                }
            }
        }
    }

    pub(crate) async fn process_tables_status_request(
        &mut self,
        request: TablesStatusRequest,
    ) -> Result<()> {
        let mut response = TablesStatusResponse::default();
        for table in request.tables {
            match self.engine.table_status(&table).await? {
                Some(status) => response.statuses.push((table, status)),
                None => trace!(%table, "skipping unknown table in status request"),
            }
        }
        self.writer
            .send(ServerPacket::TablesStatusResponse(response))
            .await
    }

    /// Send a result block along with any logs collected so far.
    async fn send_data(&mut self, block: Block) -> Result<()> {
        let mut packets = vec![ServerPacket::Data(block)];
        if let Some(logs) = self.state.active_query().and_then(|q| q.logs.as_ref()) {
            if let Some(block) = logs.queue().drain_block() {
                packets.push(ServerPacket::Log(block));
            }
        }
        self.writer.send_all(packets).await
    }

    async fn send_query_updates(&mut self) -> Result<()> {
        let packets = self.query_updates();
        self.writer.send_all(packets).await
    }

    /// Progress, logs and profile events accumulated since the last call.
    fn query_updates(&mut self) -> Vec<ServerPacket> {
        let rev = self.session.revision;
        let min_profile_events_rev = if matches!(self.state, QueryState::ReceivingInsert(_)) {
            revision::PROFILE_EVENTS_IN_INSERT
        } else {
            revision::INCREMENTAL_PROFILE_EVENTS
        };
        let host_name = &self.config.host_name;
        let Some(query) = self.state.active_query_mut() else {
            return Vec::new();
        };

        let mut packets = Vec::with_capacity(3);
        packets.push(ServerPacket::Progress(query.ctx.progress().fetch_and_reset()));
        if let Some(logs) = &query.logs {
            if let Some(block) = logs.queue().drain_block() {
                packets.push(ServerPacket::Log(block));
            }
        }
        if rev >= min_profile_events_rev && query.ctx.settings.send_profile_events {
            let now = Utc::now().timestamp() as u32;
            let counters = query.ctx.profile_events();
            if let Some(block) = query.profile_events.delta_block(counters, host_name, now) {
                packets.push(ServerPacket::ProfileEvents(block));
            }
        }
        packets
    }

    /// Send the last updates of a query followed by the end of stream.
    async fn finish_query(&mut self) -> Result<()> {
        let mut packets = self.query_updates();
        packets.push(ServerPacket::EndOfStream);
        self.writer.send_all(packets).await?;
        debug!("query finished");
        self.state = QueryState::Completed;
        Ok(())
    }

    fn client_went_away(&mut self, callbacks: &QueryCallbacks) -> NativeSrvError {
        debug!("client closed the connection during a query");
        callbacks.lower_to(CancellationStatus::FullyCancelled);
        if let Some(query) = self.state.active_query_mut() {
            query.is_connection_closed = true;
        }
        NativeSrvError::ConnectionClosed
    }
}
