#![allow(dead_code)]

use std::sync::Arc;

use assert_cmd::cmd::Command;
use memengine::MemEngine;
use nativesrv::block::Block;
use nativesrv::client::{Absorbed, ClientOptions, NativeClient, QueryResult};
use nativesrv::config::ProtocolHandlerConfig;
use nativesrv::errors::{NativeSrvError, Result};
use nativesrv::handler::ProtocolHandler;
use nativesrv::logs::ClientLogsLayer;
use nativesrv::messages::{ClientPacket, DataPacket, SettingChange};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

pub fn make_cli() -> Command {
    Command::cargo_bin(env!("CARGO_PKG_NAME")).expect("Failed to find binary")
}

/// Route events to per-query log queues so queries can ask for their logs.
pub fn init_logging() {
    logutil::configure_global_logger_with_layer(
        tracing::Level::ERROR,
        logutil::LogFormat::HumanReadable,
        std::io::sink,
        ClientLogsLayer,
    );
}

/// A handler serving in-memory connections.
pub struct TestServer {
    pub handler: ProtocolHandler,
    pub engine: MemEngine,
}

impl TestServer {
    pub fn new() -> Self {
        Self::with_config(ProtocolHandlerConfig::default(), MemEngine::new())
    }

    pub fn with_config(config: ProtocolHandlerConfig, engine: MemEngine) -> Self {
        let handler = ProtocolHandler::new(Arc::new(engine.clone()), config);
        TestServer { handler, engine }
    }

    /// Start serving a new connection, returning the client's end.
    pub fn open(&self) -> (DuplexStream, JoinHandle<Result<()>>) {
        let (client, server) = tokio::io::duplex(1 << 20);
        let handler = self.handler.clone();
        let handle = tokio::spawn(async move {
            handler
                .handle_connection(server, None, CancellationToken::new())
                .await
        });
        (client, handle)
    }

    pub async fn connect_with(&self, options: ClientOptions) -> Result<NativeClient<DuplexStream>> {
        let (conn, _handle) = self.open();
        NativeClient::connect(conn, options).await
    }

    pub async fn connect(&self) -> NativeClient<DuplexStream> {
        self.connect_with(ClientOptions::default()).await.unwrap()
    }
}

pub fn settings(pairs: &[(&str, &str)]) -> Vec<SettingChange> {
    pairs
        .iter()
        .map(|(name, value)| SettingChange::new(*name, *value))
        .collect()
}

pub async fn query_with_settings(
    client: &mut NativeClient<DuplexStream>,
    query: &str,
    settings: Vec<SettingChange>,
) -> Result<QueryResult> {
    let mut packet = client.query_packet(query);
    packet.settings = settings;
    client.send_query(packet).await?;
    client.receive_result().await
}

/// Like [`NativeClient::insert`], with settings attached to the query.
pub async fn insert_with_settings(
    client: &mut NativeClient<DuplexStream>,
    query: &str,
    settings: Vec<SettingChange>,
    blocks: Vec<Block>,
) -> Result<QueryResult> {
    let mut packet = client.query_packet(query);
    packet.settings = settings;
    client.send_query(packet).await?;

    let mut result = QueryResult::default();
    while result.header.is_none() {
        let packet = client.receive().await?;
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
        client.send(ClientPacket::Data(DataPacket::new(block))).await?;
    }
    client.send(ClientPacket::Data(DataPacket::end())).await?;
    client.receive_result().await
}

/// Code of the engine error a query failed with.
pub fn error_code<T: std::fmt::Debug>(res: Result<T>) -> i32 {
    match res {
        Err(NativeSrvError::Exec(e)) => e.code,
        other => panic!("expected an exception, got {other:?}"),
    }
}
