use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use memengine::MemEngine;
use nativesrv::auth::{Authenticator, PasswordlessAuthenticator, StaticAuthenticator};
use nativesrv::config::ProtocolHandlerConfig;
use nativesrv::handler::ProtocolHandler;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, info};
use uuid::Uuid;

use crate::args::ServerArgs;

/// Build the handler configured by the command line.
pub fn build_handler(args: &ServerArgs) -> ProtocolHandler {
    let authenticator: Arc<dyn Authenticator> = match &args.password {
        Some(password) => Arc::new(StaticAuthenticator::new().with_user(&args.user, password)),
        None => Arc::new(PasswordlessAuthenticator),
    };

    let mut config = ProtocolHandlerConfig::new(authenticator);
    config.display_name = args.display_name.clone();
    config.timezone = args.timezone.clone();
    config.parse_proxy_protocol = args.proxy_protocol;
    config.proto_send_chunked = args.send_chunked;
    config.proto_recv_chunked = args.recv_chunked;
    config.default_settings.send_timeout = Duration::from_secs(args.send_timeout);
    config.default_settings.receive_timeout = Duration::from_secs(args.receive_timeout);
    for (cluster, secret) in &args.interserver_secrets {
        config = config.with_interserver_secret(cluster, secret);
    }

    let mut engine = MemEngine::new();
    if args.async_insert {
        engine = engine.with_async_inserts();
    }
    ProtocolHandler::new(Arc::new(engine), config)
}

/// Accepts connections and runs the protocol on each of them.
#[derive(Debug)]
pub struct NativeServer {
    listener: TcpListener,
    handler: ProtocolHandler,
}

impl NativeServer {
    pub async fn bind(addr: &str, handler: ProtocolHandler) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(NativeServer { listener, handler })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handler(&self) -> &ProtocolHandler {
        &self.handler
    }

    /// Serve until `shutdown` fires. Idle connections close right away, busy
    /// ones once their current query is done.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutting down");
                    break;
                }
                result = self.listener.accept() => {
                    let (conn, client_addr) = result?;
                    conn.set_nodelay(true)?;

                    let handler = self.handler.clone();
                    let conn_id = Uuid::new_v4();
                    let span = debug_span!("native_connection", %conn_id);
                    let shutdown = shutdown.child_token();

                    tokio::spawn(
                        async move {
                            debug!(%client_addr, "client connected");
                            match handler.handle_connection(conn, Some(client_addr), shutdown).await {
                                Ok(_) => debug!(%client_addr, "client disconnected"),
                                Err(e) => debug!(%e, %client_addr, "client disconnected with error"),
                            }
                        }
                        .instrument(span),
                    );
                }
            }
        }

        let metrics = self.handler.metrics();
        info!(
            open_connections = metrics.open_connections(),
            total_connections = metrics.total_connections(),
            queries = metrics.queries(),
            exceptions = metrics.exceptions(),
            "server stopped"
        );
        Ok(())
    }
}
